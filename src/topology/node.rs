//! Node bookkeeping
//!
//! A node owns the pools and nexuses its agent hosts and carries the RPC
//! handle used to reach that agent. Replicas and nexuses refer back to their
//! node by name; the registry resolves those keys on demand.

use crate::agent::AgentClientRef;
use super::nexus::Nexus;
use super::pool::{Pool, PoolSnapshot};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A storage node and the objects its agent hosts
#[derive(Clone)]
pub struct Node {
    pub name: String,
    /// RPC handle to the node's agent
    pub client: AgentClientRef,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Pools on this node, keyed by pool name
    pub pools: IndexMap<String, Pool>,
    /// Nexuses running on this node, keyed by volume uuid
    pub nexuses: IndexMap<String, Nexus>,
}

impl Node {
    pub fn new(name: impl Into<String>, client: AgentClientRef) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            client,
            online: true,
            registered_at: now,
            last_seen: now,
            pools: IndexMap::new(),
            nexuses: IndexMap::new(),
        }
    }

    /// Record that the node was heard from
    pub fn seen(&mut self) {
        self.last_seen = Utc::now();
        self.online = true;
    }

    pub fn mark_offline(&mut self) {
        self.online = false;
    }

    /// Total replicas across the node's pools
    pub fn replica_count(&self) -> usize {
        self.pools.values().map(|p| p.replicas.len()).sum()
    }

    /// Raw capacity across the node's pools
    pub fn capacity(&self) -> u64 {
        self.pools.values().map(|p| p.capacity).sum()
    }

    /// Bytes already carved out across the node's pools
    pub fn used(&self) -> u64 {
        self.pools.values().map(|p| p.used).sum()
    }

    /// Serializable projection for API consumers
    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.name.clone(),
            online: self.online,
            registered_at: self.registered_at,
            last_seen: self.last_seen,
            pools: self.pools.values().map(|p| p.snapshot()).collect(),
            replica_count: self.replica_count() as u32,
            nexus_count: self.nexuses.len() as u32,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("online", &self.online)
            .field("pools", &self.pools.len())
            .field("nexuses", &self.nexuses.len())
            .finish()
    }
}

/// Serializable projection of a node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub name: String,
    pub online: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub pools: Vec<PoolSnapshot>,
    pub replica_count: u32,
    pub nexus_count: u32,
}
