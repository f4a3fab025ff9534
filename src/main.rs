//! Blockplane control plane daemon
//!
//! Boots the topology registry, the volume manager, the REST API, and the
//! health and metrics servers. Without a real storage fabric attached the
//! daemon seeds an in-process simulated cluster so the control plane can
//! be exercised end to end.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use blockplane::agent::{OpLog, SimAgent};
use blockplane::topology::{Registry, RegistryStats};
use blockplane::volume::{ManagerConfig, ManagerStatus, VolumeManager};
use blockplane::{Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Blockplane - Volume Reconciliation Control Plane for Distributed Block Storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Reconcile interval in seconds
    #[arg(long, env = "RECONCILE_INTERVAL", default_value = "30")]
    reconcile_interval_secs: u64,

    /// Skip refreshing replica and nexus state from agents on each tick
    #[arg(long, env = "NO_AGENT_REFRESH")]
    no_agent_refresh: bool,

    /// Number of simulated storage nodes to seed
    #[arg(long, env = "SIM_NODES", default_value = "3")]
    sim_nodes: u32,

    /// Pools per simulated node
    #[arg(long, env = "SIM_POOLS_PER_NODE", default_value = "1")]
    sim_pools_per_node: u32,

    /// Capacity of each simulated pool (e.g. "100Gi", "1Ti")
    #[arg(long, env = "SIM_POOL_CAPACITY", default_value = "100Gi")]
    sim_pool_capacity: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting blockplane control plane");
    info!("  Version: {}", blockplane::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Reconcile interval: {}s", args.reconcile_interval_secs);
    info!("  Simulated nodes: {}", args.sim_nodes);

    // Create topology registry
    let registry = Registry::new();

    // Seed the simulated cluster
    if args.sim_nodes > 0 {
        let capacity = parse_capacity(&args.sim_pool_capacity)?;
        seed_sim_cluster(&registry, args.sim_nodes, args.sim_pools_per_node, capacity).await?;
    }

    // Create and start the volume manager
    let config = ManagerConfig {
        reconcile_interval: Duration::from_secs(args.reconcile_interval_secs),
        refresh_from_agents: !args.no_agent_refresh,
    };
    let manager = VolumeManager::new(config, registry.clone());
    manager.start();
    info!("Volume manager started");

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    {
        let manager = manager.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr, manager, registry).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Cancel on ctrl-c
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    // Run the REST API until shutdown
    let api_addr: SocketAddr = args
        .api_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?;

    blockplane::api::run_rest_server(api_addr, manager.clone(), registry, shutdown).await?;

    manager.stop().await;
    info!("Control plane shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Simulated Cluster
// =============================================================================

/// Seed the registry with an in-process simulated cluster
async fn seed_sim_cluster(
    registry: &Arc<Registry>,
    nodes: u32,
    pools_per_node: u32,
    pool_capacity: u64,
) -> Result<()> {
    let log = OpLog::new();

    for i in 1..=nodes {
        let name = format!("node-{}", i);
        let agent = SimAgent::new(name.as_str(), log.clone());
        for j in 1..=pools_per_node {
            agent
                .add_pool(&format!("pool-{}-{}", i, j), pool_capacity)
                .await;
        }
        let reports = agent.pool_reports().await;
        registry.register_node(&name, Arc::new(agent), reports)?;
    }

    info!(
        "Simulated cluster ready: {} nodes, {} pools each",
        nodes, pools_per_node
    );
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Gauges exported by the metrics endpoint, refreshed on every scrape
#[derive(Clone)]
struct ControlPlaneMetrics {
    nodes_total: prometheus::Gauge,
    nodes_online: prometheus::Gauge,
    pools_total: prometheus::Gauge,
    replicas_total: prometheus::Gauge,
    nexuses_total: prometheus::Gauge,
    capacity_bytes: prometheus::Gauge,
    available_bytes: prometheus::Gauge,
    volumes_total: prometheus::Gauge,
    volumes_healthy: prometheus::Gauge,
    volumes_degraded: prometheus::Gauge,
    volumes_faulted: prometheus::Gauge,
    volumes_created: prometheus::Gauge,
    volumes_destroyed: prometheus::Gauge,
}

impl ControlPlaneMetrics {
    fn register() -> Result<Self> {
        let gauge = |name: &str, help: &str| {
            prometheus::register_gauge!(name, help)
                .map_err(|e| Error::Internal(format!("Failed to register metric {}: {}", name, e)))
        };

        Ok(Self {
            nodes_total: gauge("blockplane_nodes_total", "Total number of registered nodes")?,
            nodes_online: gauge("blockplane_nodes_online", "Number of online nodes")?,
            pools_total: gauge("blockplane_pools_total", "Total number of storage pools")?,
            replicas_total: gauge("blockplane_replicas_total", "Total number of replicas")?,
            nexuses_total: gauge("blockplane_nexuses_total", "Total number of nexuses")?,
            capacity_bytes: gauge(
                "blockplane_capacity_bytes_total",
                "Total raw pool capacity in bytes",
            )?,
            available_bytes: gauge(
                "blockplane_capacity_bytes_available",
                "Unallocated pool capacity in bytes",
            )?,
            volumes_total: gauge("blockplane_volumes_total", "Total number of volumes")?,
            volumes_healthy: gauge("blockplane_volumes_healthy", "Number of healthy volumes")?,
            volumes_degraded: gauge("blockplane_volumes_degraded", "Number of degraded volumes")?,
            volumes_faulted: gauge("blockplane_volumes_faulted", "Number of faulted volumes")?,
            volumes_created: gauge(
                "blockplane_volumes_created_total",
                "Volumes created since startup",
            )?,
            volumes_destroyed: gauge(
                "blockplane_volumes_destroyed_total",
                "Volumes destroyed since startup",
            )?,
        })
    }

    fn refresh(&self, status: &ManagerStatus, stats: &RegistryStats) {
        self.nodes_total.set(stats.total_nodes as f64);
        self.nodes_online.set(stats.online_nodes as f64);
        self.pools_total.set(stats.total_pools as f64);
        self.replicas_total.set(stats.total_replicas as f64);
        self.nexuses_total.set(stats.total_nexuses as f64);
        self.capacity_bytes.set(stats.total_capacity_bytes as f64);
        self.available_bytes.set(stats.available_capacity_bytes as f64);
        self.volumes_total.set(status.volumes as f64);
        self.volumes_healthy.set(status.healthy as f64);
        self.volumes_degraded.set(status.degraded as f64);
        self.volumes_faulted.set(status.faulted as f64);
        self.volumes_created.set(status.created_total as f64);
        self.volumes_destroyed.set(status.destroyed_total as f64);
    }
}

async fn run_metrics_server(
    addr: &str,
    manager: Arc<VolumeManager>,
    registry: Arc<Registry>,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let metrics = ControlPlaneMetrics::register()?;

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        let registry = registry.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                let registry = registry.clone();
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.refresh(&manager.status(), &registry.stats());

                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            encoder.encode(&metric_families, &mut buffer).unwrap();

                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .unwrap()
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .unwrap(),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Capacity Parsing
// =============================================================================

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let mut num_end = 0;
    for (i, c) in s.char_indices() {
        if !c.is_ascii_digit() && c != '.' {
            num_end = i;
            break;
        }
        num_end = i + 1;
    }

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        "P" | "PB" | "PI" | "PIB" => 1024 * 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}
