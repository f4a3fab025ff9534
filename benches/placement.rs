//! Benchmark for replica placement over the cluster topology
//!
//! Measures candidate ranking cost as the node count grows.

use blockplane::agent::{OpLog, SimAgent};
use blockplane::topology::{PoolReport, PoolState, Registry};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

const GIB: u64 = 1024 * 1024 * 1024;

/// Build a registry with `nodes` single-pool nodes of staggered usage
fn build_registry(nodes: usize) -> Arc<Registry> {
    let registry = Registry::new();
    let log = OpLog::new();

    for i in 0..nodes {
        let name = format!("node-{:04}", i);
        let agent = Arc::new(SimAgent::new(name.as_str(), log.clone()));
        let report = PoolReport {
            name: format!("pool-{:04}", i),
            state: PoolState::Online,
            capacity: 100 * GIB,
            used: (i as u64 % 50) * GIB,
        };
        let _ = registry.register_node(&name, agent, vec![report]);
    }

    registry
}

fn bench_choose_pools(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");
    group.throughput(Throughput::Elements(1));

    for size in [10usize, 100, 1000] {
        let registry = build_registry(size);
        group.bench_with_input(BenchmarkId::new("choose_pools", size), &size, |b, _| {
            b.iter(|| {
                let candidates = registry.choose_pools(black_box(10 * GIB), &[], &[]);
                black_box(candidates)
            });
        });
    }

    group.finish();
}

fn bench_choose_pools_preferred(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");
    group.throughput(Throughput::Elements(1));

    let registry = build_registry(1000);
    let preferred: Vec<String> = (0..8).map(|i| format!("node-{:04}", i * 100)).collect();

    group.bench_function("choose_pools_preferred_1000", |b| {
        b.iter(|| {
            let candidates = registry.choose_pools(black_box(10 * GIB), &preferred, &[]);
            black_box(candidates)
        });
    });

    group.finish();
}

fn bench_register_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("placement");
    group.throughput(Throughput::Elements(1));

    group.bench_function("register_single_node", |b| {
        let registry = Registry::new();
        let log = OpLog::new();
        let mut counter = 0u64;

        b.iter(|| {
            counter += 1;
            let name = format!("node-{}", counter);
            let agent = Arc::new(SimAgent::new(name.as_str(), log.clone()));
            let _ = registry.register_node(
                black_box(&name),
                agent,
                vec![PoolReport::new(format!("pool-{}", counter), 100 * GIB)],
            );
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_choose_pools,
    bench_choose_pools_preferred,
    bench_register_nodes,
);
criterion_main!(benches);
