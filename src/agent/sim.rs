//! Simulated Storage Agent
//!
//! In-memory implementation of [`AgentClient`] backing the built-in
//! simulated cluster and the engine's test suites. Objects live in plain
//! maps; capacity accounting, idempotency, and rebuild staging mimic a
//! real io-engine closely enough to drive the reconciler.

use crate::agent::client::AgentClient;
use crate::error::{Error, Result};
use crate::topology::{Child, ChildState, Nexus, NexusState, PoolReport, PoolState, Replica, ShareProtocol};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

// =============================================================================
// Operation Log
// =============================================================================

/// One recorded agent call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    pub node: String,
    pub op: &'static str,
    pub uuid: String,
}

/// Shared log of agent calls, in arrival order
///
/// Cloned into every [`SimAgent`] of a cluster so tests can assert on call
/// counts and cross-node ordering.
#[derive(Clone, Default)]
pub struct OpLog {
    records: Arc<Mutex<Vec<OpRecord>>>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, node: &str, op: &'static str, uuid: &str) {
        self.records.lock().push(OpRecord {
            node: node.into(),
            op,
            uuid: uuid.into(),
        });
    }

    pub fn snapshot(&self) -> Vec<OpRecord> {
        self.records.lock().clone()
    }

    /// Number of recorded calls of one operation
    pub fn count(&self, op: &str) -> usize {
        self.records.lock().iter().filter(|r| r.op == op).count()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

// =============================================================================
// Simulated Agent
// =============================================================================

#[derive(Debug, Clone)]
struct SimPool {
    name: String,
    capacity: u64,
    used: u64,
    state: PoolState,
}

#[derive(Default)]
struct SimState {
    pools: BTreeMap<String, SimPool>,
    replicas: BTreeMap<String, Replica>,
    nexuses: BTreeMap<String, Nexus>,
    /// Operations forced to fail, by name
    failing: BTreeSet<String>,
    next_nbd: u32,
}

/// In-memory storage agent for one simulated node
pub struct SimAgent {
    node: String,
    log: OpLog,
    inner: RwLock<SimState>,
}

impl SimAgent {
    pub fn new(node: impl Into<String>, log: OpLog) -> Self {
        Self {
            node: node.into(),
            log,
            inner: RwLock::new(SimState::default()),
        }
    }

    /// Carve out a pool on this node
    pub async fn add_pool(&self, name: &str, capacity: u64) {
        let mut state = self.inner.write().await;
        state.pools.insert(
            name.to_string(),
            SimPool {
                name: name.to_string(),
                capacity,
                used: 0,
                state: PoolState::Online,
            },
        );
    }

    /// Pool inventory in the shape node registration expects
    pub async fn pool_reports(&self) -> Vec<PoolReport> {
        let state = self.inner.read().await;
        state
            .pools
            .values()
            .map(|p| PoolReport {
                name: p.name.clone(),
                state: p.state,
                capacity: p.capacity,
                used: p.used,
            })
            .collect()
    }

    /// Force the named operation to fail until cleared
    pub async fn fail_on(&self, op: &str) {
        self.inner.write().await.failing.insert(op.to_string());
    }

    pub async fn clear_fail(&self, op: &str) {
        self.inner.write().await.failing.remove(op);
    }

    /// Finish any in-progress rebuild on a nexus
    pub async fn rebuild_complete(&self, uuid: &str) {
        let mut state = self.inner.write().await;
        if let Some(nexus) = state.nexuses.get_mut(uuid) {
            for child in &mut nexus.children {
                child.state = ChildState::Online;
            }
            nexus.state = NexusState::Online;
        }
    }

    fn fault(&self, operation: &str) -> Error {
        Error::RemoteCall {
            node: self.node.clone(),
            operation: operation.into(),
            reason: "injected fault".into(),
        }
    }

    fn check(&self, state: &SimState, operation: &str) -> Result<()> {
        if state.failing.contains(operation) {
            return Err(self.fault(operation));
        }
        Ok(())
    }

    fn share_uri(&self, uuid: &str, share: ShareProtocol) -> String {
        match share {
            ShareProtocol::None => format!("bdev:///{}", uuid),
            ShareProtocol::Nvmf => {
                format!("nvmf://{}:8420/nqn.2019-05.io.openebs:{}", self.node, uuid)
            }
            ShareProtocol::Iscsi => {
                format!("iscsi://{}:3260/iqn.2019-05.io.openebs:{}", self.node, uuid)
            }
        }
    }
}

#[async_trait]
impl AgentClient for SimAgent {
    async fn create_replica(
        &self,
        uuid: &str,
        pool: &str,
        size: u64,
        thin: bool,
        share: ShareProtocol,
    ) -> Result<Replica> {
        self.log.record(&self.node, "create_replica", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "create_replica")?;

        if let Some(existing) = state.replicas.get(uuid) {
            return Ok(existing.clone());
        }

        let uri = self.share_uri(uuid, share);
        let replica = {
            let sim_pool = state.pools.get_mut(pool).ok_or_else(|| Error::RemoteCall {
                node: self.node.clone(),
                operation: "create_replica".into(),
                reason: format!("pool {} not found", pool),
            })?;
            if sim_pool.capacity.saturating_sub(sim_pool.used) < size {
                return Err(Error::RemoteCall {
                    node: self.node.clone(),
                    operation: "create_replica".into(),
                    reason: format!("pool {} out of space", pool),
                });
            }
            sim_pool.used += size;
            Replica {
                uuid: uuid.to_string(),
                node: self.node.clone(),
                pool: sim_pool.name.clone(),
                size,
                thin,
                share,
                uri,
            }
        };
        state.replicas.insert(uuid.to_string(), replica.clone());
        Ok(replica)
    }

    async fn destroy_replica(&self, uuid: &str) -> Result<()> {
        self.log.record(&self.node, "destroy_replica", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "destroy_replica")?;

        if let Some(replica) = state.replicas.remove(uuid) {
            if let Some(pool) = state.pools.get_mut(&replica.pool) {
                pool.used = pool.used.saturating_sub(replica.size);
            }
        }
        Ok(())
    }

    async fn list_replicas(&self) -> Result<Vec<Replica>> {
        self.log.record(&self.node, "list_replicas", "");
        let state = self.inner.read().await;
        self.check(&state, "list_replicas")?;
        Ok(state.replicas.values().cloned().collect())
    }

    async fn share_replica(&self, uuid: &str, share: ShareProtocol) -> Result<String> {
        self.log.record(&self.node, "share_replica", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "share_replica")?;

        let uri = self.share_uri(uuid, share);
        let replica = state.replicas.get_mut(uuid).ok_or_else(|| Error::RemoteCall {
            node: self.node.clone(),
            operation: "share_replica".into(),
            reason: format!("replica {} not found", uuid),
        })?;
        replica.share = share;
        replica.uri = uri.clone();
        Ok(uri)
    }

    async fn create_nexus(&self, uuid: &str, size: u64, children: &[String]) -> Result<Nexus> {
        self.log.record(&self.node, "create_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "create_nexus")?;

        if let Some(existing) = state.nexuses.get(uuid) {
            return Ok(existing.clone());
        }

        let nexus = Nexus {
            uuid: uuid.to_string(),
            node: self.node.clone(),
            size,
            state: NexusState::Online,
            children: children
                .iter()
                .map(|uri| Child {
                    uri: uri.clone(),
                    state: ChildState::Online,
                })
                .collect(),
            device_path: None,
            share: ShareProtocol::None,
        };
        state.nexuses.insert(uuid.to_string(), nexus.clone());
        Ok(nexus)
    }

    async fn destroy_nexus(&self, uuid: &str) -> Result<()> {
        self.log.record(&self.node, "destroy_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "destroy_nexus")?;
        state.nexuses.remove(uuid);
        Ok(())
    }

    async fn list_nexus(&self) -> Result<Vec<Nexus>> {
        self.log.record(&self.node, "list_nexus", "");
        let state = self.inner.read().await;
        self.check(&state, "list_nexus")?;
        Ok(state.nexuses.values().cloned().collect())
    }

    async fn add_child_nexus(&self, uuid: &str, uri: &str) -> Result<Child> {
        self.log.record(&self.node, "add_child_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "add_child_nexus")?;

        let nexus = state.nexuses.get_mut(uuid).ok_or_else(|| Error::RemoteCall {
            node: self.node.clone(),
            operation: "add_child_nexus".into(),
            reason: format!("nexus {} not found", uuid),
        })?;
        if let Some(child) = nexus.find_child(uri) {
            return Ok(child.clone());
        }

        // New children stay degraded until the rebuild onto them finishes.
        let child = Child {
            uri: uri.to_string(),
            state: ChildState::Degraded,
        };
        nexus.children.push(child.clone());
        nexus.state = NexusState::Degraded;
        Ok(child)
    }

    async fn remove_child_nexus(&self, uuid: &str, uri: &str) -> Result<()> {
        self.log.record(&self.node, "remove_child_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "remove_child_nexus")?;

        let nexus = state.nexuses.get_mut(uuid).ok_or_else(|| Error::RemoteCall {
            node: self.node.clone(),
            operation: "remove_child_nexus".into(),
            reason: format!("nexus {} not found", uuid),
        })?;
        nexus.children.retain(|c| c.uri != uri);
        if nexus.children.iter().all(|c| c.is_online()) {
            nexus.state = NexusState::Online;
        }
        Ok(())
    }

    async fn publish_nexus(&self, uuid: &str, _key: &str) -> Result<String> {
        self.log.record(&self.node, "publish_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "publish_nexus")?;

        let device = state.next_nbd;
        let nexus = state.nexuses.get_mut(uuid).ok_or_else(|| Error::RemoteCall {
            node: self.node.clone(),
            operation: "publish_nexus".into(),
            reason: format!("nexus {} not found", uuid),
        })?;
        if let Some(path) = &nexus.device_path {
            return Ok(path.clone());
        }
        let path = format!("/dev/nbd{}", device);
        nexus.device_path = Some(path.clone());
        state.next_nbd += 1;
        Ok(path)
    }

    async fn unpublish_nexus(&self, uuid: &str) -> Result<()> {
        self.log.record(&self.node, "unpublish_nexus", uuid);
        let mut state = self.inner.write().await;
        self.check(&state, "unpublish_nexus")?;

        if let Some(nexus) = state.nexuses.get_mut(uuid) {
            nexus.device_path = None;
            nexus.share = ShareProtocol::None;
        }
        Ok(())
    }
}
