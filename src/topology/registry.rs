//! Cluster Topology Registry
//!
//! Single authoritative owner of the cluster graph: the registry owns nodes,
//! nodes own pools and nexuses, pools own replicas. Everything else keeps
//! plain name keys into this structure and looks objects up on demand.
//!
//! Mutators broadcast a [`TopologyEvent`] so the volume manager can fold
//! observed changes into the volumes it tracks. Events are suppressed when
//! an upsert carries no actual change.

use crate::agent::AgentClientRef;
use crate::error::{Error, Result};
use super::events::TopologyEvent;
use super::nexus::Nexus;
use super::node::{Node, NodeSnapshot};
use super::pool::{Pool, PoolReport, PoolSnapshot, PoolState};
use super::replica::Replica;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the topology event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Pool Candidate
// =============================================================================

/// A pool considered for replica placement, snapshotted at selection time
///
/// Capacity may be claimed by a concurrent operation between selection and
/// the dependent create call; such races surface as ordinary remote errors.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub node: String,
    pub pool: String,
    pub state: PoolState,
    /// Free bytes at selection time
    pub free: u64,
    /// Rank in the caller's preferred-node list, `usize::MAX` when absent
    pub preference: usize,
}

// =============================================================================
// Registry Stats
// =============================================================================

/// Snapshot of cluster-wide counters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub total_pools: u64,
    pub total_replicas: u64,
    pub total_nexuses: u64,
    pub total_capacity_bytes: u64,
    pub available_capacity_bytes: u64,
}

// =============================================================================
// Registry
// =============================================================================

/// Authoritative view of the cluster graph
pub struct Registry {
    /// Nodes keyed by name
    nodes: RwLock<HashMap<String, Node>>,
    /// Topology change broadcaster
    event_sender: broadcast::Sender<TopologyEvent>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            nodes: RwLock::new(HashMap::new()),
            event_sender,
        })
    }

    /// Get a topology event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.event_sender.subscribe()
    }

    fn publish(&self, event: TopologyEvent) {
        let _ = self.event_sender.send(event);
    }

    // =========================================================================
    // Node Lifecycle
    // =========================================================================

    /// Register a node together with its pool inventory
    pub fn register_node(
        &self,
        name: &str,
        client: AgentClientRef,
        pools: Vec<PoolReport>,
    ) -> Result<()> {
        let pool_names: Vec<String> = {
            let mut nodes = self.nodes.write();
            if nodes.contains_key(name) {
                return Err(Error::NodeAlreadyRegistered { node: name.into() });
            }
            let mut node = Node::new(name, client);
            for report in pools {
                let pool = Pool::from_report(name, report);
                node.pools.insert(pool.name.clone(), pool);
            }
            let pool_names = node.pools.keys().cloned().collect();
            nodes.insert(name.to_string(), node);
            pool_names
        };

        info!(node = %name, pools = pool_names.len(), "Registered node");

        self.publish(TopologyEvent::NodeRegistered { node: name.into() });
        for pool in pool_names {
            self.publish(TopologyEvent::PoolAdded {
                node: name.into(),
                pool,
            });
        }
        Ok(())
    }

    /// Remove a node and everything it hosts
    pub fn unregister_node(&self, name: &str) -> Result<()> {
        let node = {
            let mut nodes = self.nodes.write();
            nodes
                .remove(name)
                .ok_or_else(|| Error::NodeNotFound { node: name.into() })?
        };

        info!(
            node = %name,
            replicas = node.replica_count(),
            nexuses = node.nexuses.len(),
            "Unregistered node"
        );

        // Object removals go out first so volume bookkeeping is stripped
        // before consumers learn the node itself is gone.
        for nexus in node.nexuses.values() {
            self.publish(TopologyEvent::NexusRemoved {
                nexus: nexus.clone(),
            });
        }
        for pool in node.pools.values() {
            for replica in pool.replicas.values() {
                self.publish(TopologyEvent::ReplicaRemoved {
                    replica: replica.clone(),
                });
            }
            self.publish(TopologyEvent::PoolRemoved {
                node: name.into(),
                pool: pool.name.clone(),
            });
        }
        self.publish(TopologyEvent::NodeUnregistered { node: name.into() });
        Ok(())
    }

    /// Flip a node's reachability
    pub fn set_node_online(&self, name: &str, online: bool) -> Result<()> {
        let changed = {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| Error::NodeNotFound { node: name.into() })?;
            let changed = node.online != online;
            if online {
                node.seen();
            } else {
                node.mark_offline();
            }
            changed
        };

        if changed {
            info!(node = %name, online, "Node reachability changed");
            if online {
                self.publish(TopologyEvent::NodeOnline { node: name.into() });
            } else {
                self.publish(TopologyEvent::NodeOffline { node: name.into() });
            }
        }
        Ok(())
    }

    /// Fold a node's pool report into the graph
    ///
    /// Pools absent from the report are dropped along with their replicas.
    pub fn update_pools(&self, name: &str, reports: Vec<PoolReport>) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.write();
            let node = nodes
                .get_mut(name)
                .ok_or_else(|| Error::NodeNotFound { node: name.into() })?;
            node.seen();

            for report in &reports {
                match node.pools.get_mut(&report.name) {
                    Some(pool) => {
                        if pool.apply_report(report) {
                            events.push(TopologyEvent::PoolChanged {
                                node: name.into(),
                                pool: report.name.clone(),
                            });
                        }
                    }
                    None => {
                        let pool = Pool::from_report(name, report.clone());
                        node.pools.insert(pool.name.clone(), pool);
                        events.push(TopologyEvent::PoolAdded {
                            node: name.into(),
                            pool: report.name.clone(),
                        });
                    }
                }
            }

            let reported: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
            let dropped: Vec<String> = node
                .pools
                .keys()
                .filter(|name| !reported.contains(&name.as_str()))
                .cloned()
                .collect();
            for pool_name in dropped {
                if let Some(pool) = node.pools.shift_remove(&pool_name) {
                    for replica in pool.replicas.values() {
                        events.push(TopologyEvent::ReplicaRemoved {
                            replica: replica.clone(),
                        });
                    }
                    events.push(TopologyEvent::PoolRemoved {
                        node: name.into(),
                        pool: pool_name,
                    });
                }
            }
        }

        for event in events {
            self.publish(event);
        }
        Ok(())
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Get a node by name
    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.read().get(name).cloned()
    }

    /// Get the RPC handle for a node, failing when it is gone or unreachable
    pub fn node_client(&self, name: &str) -> Result<AgentClientRef> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(name)
            .ok_or_else(|| Error::NodeNotFound { node: name.into() })?;
        if !node.online {
            return Err(Error::NodeOffline { node: name.into() });
        }
        Ok(node.client.clone())
    }

    /// Get a pool by node and name
    pub fn pool(&self, node: &str, pool: &str) -> Option<Pool> {
        self.nodes
            .read()
            .get(node)
            .and_then(|n| n.pools.get(pool).cloned())
    }

    /// All replicas of a volume, across the whole cluster
    pub fn replica_set(&self, uuid: &str) -> Vec<Replica> {
        let nodes = self.nodes.read();
        let mut replicas = Vec::new();
        for node in nodes.values() {
            for pool in node.pools.values() {
                if let Some(replica) = pool.replicas.get(uuid) {
                    replicas.push(replica.clone());
                }
            }
        }
        replicas
    }

    /// Find the nexus of a volume, if any node hosts one
    pub fn lookup_nexus(&self, uuid: &str) -> Option<Nexus> {
        let nodes = self.nodes.read();
        for node in nodes.values() {
            if let Some(nexus) = node.nexuses.get(uuid) {
                return Some(nexus.clone());
            }
        }
        None
    }

    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_nodes(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> =
            self.nodes.read().values().map(|n| n.snapshot()).collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub fn list_pools(&self) -> Vec<PoolSnapshot> {
        let nodes = self.nodes.read();
        let mut pools: Vec<PoolSnapshot> = nodes
            .values()
            .flat_map(|n| n.pools.values().map(|p| p.snapshot()))
            .collect();
        pools.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.name.cmp(&b.name)));
        pools
    }

    /// Cluster-wide counters
    pub fn stats(&self) -> RegistryStats {
        let nodes = self.nodes.read();
        let mut stats = RegistryStats {
            total_nodes: nodes.len() as u64,
            online_nodes: 0,
            total_pools: 0,
            total_replicas: 0,
            total_nexuses: 0,
            total_capacity_bytes: 0,
            available_capacity_bytes: 0,
        };
        for node in nodes.values() {
            if node.online {
                stats.online_nodes += 1;
            }
            stats.total_pools += node.pools.len() as u64;
            stats.total_replicas += node.replica_count() as u64;
            stats.total_nexuses += node.nexuses.len() as u64;
            stats.total_capacity_bytes += node.capacity();
            stats.available_capacity_bytes += node.capacity().saturating_sub(node.used());
        }
        stats
    }

    // =========================================================================
    // Object Mutators
    // =========================================================================

    /// Upsert a replica into its pool's books
    ///
    /// Best effort: a replica whose node or pool has meanwhile left the graph
    /// is dropped with a warning, since there is nothing to attach it to.
    pub fn insert_replica(&self, replica: Replica) {
        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&replica.node) else {
                warn!(
                    volume = %replica.uuid,
                    node = %replica.node,
                    "Dropping replica for unknown node"
                );
                return;
            };
            let Some(pool) = node.pools.get_mut(&replica.pool) else {
                warn!(
                    volume = %replica.uuid,
                    node = %replica.node,
                    pool = %replica.pool,
                    "Dropping replica for unknown pool"
                );
                return;
            };
            match pool.insert_replica(replica.clone()) {
                None => Some(TopologyEvent::ReplicaAdded { replica }),
                Some(previous) if previous != replica => {
                    Some(TopologyEvent::ReplicaChanged { replica })
                }
                Some(_) => None,
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
    }

    /// Drop a replica from its pool's books; no-op when already gone
    pub fn remove_replica(&self, node: &str, pool: &str, uuid: &str) {
        let removed = {
            let mut nodes = self.nodes.write();
            nodes
                .get_mut(node)
                .and_then(|n| n.pools.get_mut(pool))
                .and_then(|p| p.remove_replica(uuid))
        };
        if let Some(replica) = removed {
            self.publish(TopologyEvent::ReplicaRemoved { replica });
        }
    }

    /// Upsert a nexus into its node's books
    pub fn insert_nexus(&self, nexus: Nexus) {
        let event = {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(&nexus.node) else {
                warn!(
                    volume = %nexus.uuid,
                    node = %nexus.node,
                    "Dropping nexus for unknown node"
                );
                return;
            };
            match node.nexuses.insert(nexus.uuid.clone(), nexus.clone()) {
                None => Some(TopologyEvent::NexusAdded { nexus }),
                Some(previous) if previous != nexus => {
                    Some(TopologyEvent::NexusChanged { nexus })
                }
                Some(_) => None,
            }
        };
        if let Some(event) = event {
            self.publish(event);
        }
    }

    /// Drop a nexus from its node's books; no-op when already gone
    pub fn remove_nexus(&self, node: &str, uuid: &str) {
        let removed = {
            let mut nodes = self.nodes.write();
            nodes
                .get_mut(node)
                .and_then(|n| n.nexuses.shift_remove(uuid))
        };
        if let Some(nexus) = removed {
            self.publish(TopologyEvent::NexusRemoved { nexus });
        }
    }

    /// Reconcile one node's replica and nexus sets with an agent report
    ///
    /// Objects in the report are upserted, objects missing from it are
    /// dropped. Used by the manager's periodic agent refresh.
    pub fn apply_node_report(&self, name: &str, replicas: Vec<Replica>, nexuses: Vec<Nexus>) {
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.write();
            let Some(node) = nodes.get_mut(name) else {
                warn!(node = %name, "Dropping report for unknown node");
                return;
            };
            node.seen();

            // Replicas: upsert reported, drop the rest per pool.
            for replica in &replicas {
                let Some(pool) = node.pools.get_mut(&replica.pool) else {
                    debug!(
                        volume = %replica.uuid,
                        pool = %replica.pool,
                        "Reported replica names an unknown pool"
                    );
                    continue;
                };
                match pool.insert_replica(replica.clone()) {
                    None => events.push(TopologyEvent::ReplicaAdded {
                        replica: replica.clone(),
                    }),
                    Some(previous) if previous != *replica => {
                        events.push(TopologyEvent::ReplicaChanged {
                            replica: replica.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            for pool in node.pools.values_mut() {
                let stale: Vec<String> = pool
                    .replicas
                    .keys()
                    .filter(|uuid| !replicas.iter().any(|r| r.uuid == **uuid))
                    .cloned()
                    .collect();
                for uuid in stale {
                    if let Some(replica) = pool.remove_replica(&uuid) {
                        events.push(TopologyEvent::ReplicaRemoved { replica });
                    }
                }
            }

            // Nexuses: same shape.
            for nexus in &nexuses {
                match node.nexuses.insert(nexus.uuid.clone(), nexus.clone()) {
                    None => events.push(TopologyEvent::NexusAdded {
                        nexus: nexus.clone(),
                    }),
                    Some(previous) if previous != *nexus => {
                        events.push(TopologyEvent::NexusChanged {
                            nexus: nexus.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
            let stale: Vec<String> = node
                .nexuses
                .keys()
                .filter(|uuid| !nexuses.iter().any(|n| n.uuid == **uuid))
                .cloned()
                .collect();
            for uuid in stale {
                if let Some(nexus) = node.nexuses.shift_remove(&uuid) {
                    events.push(TopologyEvent::NexusRemoved { nexus });
                }
            }
        }

        for event in events {
            self.publish(event);
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Rank every pool able to host a replica of the given size
    ///
    /// Offline nodes and pools are excluded, as are pools without enough free
    /// capacity. A non-empty `required_nodes` restricts candidates to those
    /// nodes. The result is ordered best-first: online pools before degraded
    /// ones, then by preferred-node rank, then by free capacity, with the
    /// pool name as a deterministic tiebreak. The caller decides how many
    /// distinct nodes it needs from the list.
    pub fn choose_pools(
        &self,
        required_bytes: u64,
        preferred_nodes: &[String],
        required_nodes: &[String],
    ) -> Vec<PoolCandidate> {
        let mut candidates: Vec<PoolCandidate> = Vec::new();
        {
            let nodes = self.nodes.read();
            for node in nodes.values() {
                if !node.online {
                    continue;
                }
                if !required_nodes.is_empty() && !required_nodes.contains(&node.name) {
                    continue;
                }
                let preference = preferred_nodes
                    .iter()
                    .position(|n| *n == node.name)
                    .unwrap_or(usize::MAX);
                for pool in node.pools.values() {
                    if !pool.can_fit(required_bytes) {
                        continue;
                    }
                    candidates.push(PoolCandidate {
                        node: node.name.clone(),
                        pool: pool.name.clone(),
                        state: pool.state,
                        free: pool.free(),
                        preference,
                    });
                }
            }
        }

        candidates.sort_by(|a, b| {
            let a_degraded = a.state == PoolState::Degraded;
            let b_degraded = b.state == PoolState::Degraded;
            a_degraded
                .cmp(&b_degraded)
                .then_with(|| a.preference.cmp(&b.preference))
                .then_with(|| b.free.cmp(&a.free))
                .then_with(|| a.pool.cmp(&b.pool))
        });

        debug!(
            required_bytes,
            candidates = candidates.len(),
            "Ranked placement candidates"
        );
        candidates
    }
}
