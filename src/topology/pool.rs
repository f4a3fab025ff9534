//! Storage pool bookkeeping
//!
//! A pool is a fixed slab of raw capacity on one node. Replicas are carved
//! from pools; the registry keeps usage in step with replica placement.

use super::replica::Replica;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// =============================================================================
// Pool State
// =============================================================================

/// Health of a pool as reported by its node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Online,
    Degraded,
    Offline,
}

impl PoolState {
    /// Offline pools take no new replicas
    pub fn can_allocate(&self) -> bool {
        !matches!(self, PoolState::Offline)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolState::Online => write!(f, "online"),
            PoolState::Degraded => write!(f, "degraded"),
            PoolState::Offline => write!(f, "offline"),
        }
    }
}

// =============================================================================
// Pool Report
// =============================================================================

/// Pool inventory as carried by a node report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    pub name: String,
    pub state: PoolState,
    /// Total raw capacity in bytes
    pub capacity: u64,
    /// Bytes already carved out
    pub used: u64,
}

impl PoolReport {
    /// Report for a fresh, empty pool
    pub fn new(name: impl Into<String>, capacity: u64) -> Self {
        Self {
            name: name.into(),
            state: PoolState::Online,
            capacity,
            used: 0,
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// A slab of raw capacity on one node
#[derive(Debug, Clone)]
pub struct Pool {
    pub name: String,
    /// Node the pool lives on
    pub node: String,
    pub state: PoolState,
    pub capacity: u64,
    pub used: u64,
    /// Replicas carved from this pool, keyed by volume uuid
    pub replicas: IndexMap<String, Replica>,
}

impl Pool {
    /// Materialize a pool from a node report
    pub fn from_report(node: impl Into<String>, report: PoolReport) -> Self {
        Self {
            name: report.name,
            node: node.into(),
            state: report.state,
            capacity: report.capacity,
            used: report.used,
            replicas: IndexMap::new(),
        }
    }

    /// Fold a fresh report into the pool, keeping the replica set
    pub fn apply_report(&mut self, report: &PoolReport) -> bool {
        let changed = self.state != report.state
            || self.capacity != report.capacity
            || self.used != report.used;
        self.state = report.state;
        self.capacity = report.capacity;
        self.used = report.used;
        changed
    }

    /// Bytes still available for new replicas
    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }

    /// Whether a replica of the given size fits right now
    pub fn can_fit(&self, bytes: u64) -> bool {
        self.state.can_allocate() && self.free() >= bytes
    }

    /// Track a replica carved from this pool
    pub fn insert_replica(&mut self, replica: Replica) -> Option<Replica> {
        let previous = self.replicas.insert(replica.uuid.clone(), replica);
        self.recount_used();
        previous
    }

    /// Drop a replica from the pool's books
    pub fn remove_replica(&mut self, uuid: &str) -> Option<Replica> {
        let removed = self.replicas.shift_remove(uuid);
        self.recount_used();
        removed
    }

    fn recount_used(&mut self) {
        self.used = self.replicas.values().map(|r| r.size).sum();
    }

    /// Serializable projection for API consumers
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            name: self.name.clone(),
            node: self.node.clone(),
            state: self.state,
            capacity: self.capacity,
            used: self.used,
            replica_count: self.replicas.len() as u32,
        }
    }
}

/// Serializable projection of a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub name: String,
    pub node: String,
    pub state: PoolState,
    pub capacity: u64,
    pub used: u64,
    pub replica_count: u32,
}
