//! Volume State Machine
//!
//! A [`Volume`] pairs a desired spec with the replicas and nexus observed
//! for it, derives a health state from the two, and carries the operations
//! that move observed toward desired. All remote work for one volume is
//! serialized through its operation lock; the shared registry and event
//! bus are updated as each step lands, so a crash between steps leaves
//! consistent books.

use crate::error::{Error, Result};
use crate::topology::{ChildState, Nexus, NexusState, PoolCandidate, Registry, Replica, ShareProtocol};
use crate::volume::events::{EventBus, EventKind, EventObject};
use crate::volume::spec::VolumeSpec;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// =============================================================================
// Volume State
// =============================================================================

/// Health of a volume, derived from its nexus and children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Declared but not realized on any node
    Pending,
    /// Full redundancy, all children online
    Healthy,
    /// Serving IO with reduced redundancy or a rebuild in progress
    Degraded,
    /// No online children remain
    Faulted,
    /// The nexus node is unreachable
    Offline,
}

impl VolumeState {
    /// Whether the volume can serve IO at all
    pub fn is_available(&self) -> bool {
        matches!(self, VolumeState::Healthy | VolumeState::Degraded)
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeState::Pending => write!(f, "pending"),
            VolumeState::Healthy => write!(f, "healthy"),
            VolumeState::Degraded => write!(f, "degraded"),
            VolumeState::Faulted => write!(f, "faulted"),
            VolumeState::Offline => write!(f, "offline"),
        }
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time copy of a volume, as carried by events and the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshot {
    pub uuid: String,
    pub spec: VolumeSpec,
    pub size: u64,
    pub state: VolumeState,
    /// Replicas keyed by hosting node
    pub replicas: HashMap<String, Replica>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nexus: Option<Nexus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VolumeSnapshot {
    pub fn device_path(&self) -> Option<&str> {
        self.nexus.as_ref().and_then(|n| n.device_path.as_deref())
    }
}

// =============================================================================
// Volume
// =============================================================================

struct VolumeInner {
    spec: VolumeSpec,
    /// Provisioned size in bytes, zero until realized
    size: u64,
    state: VolumeState,
    /// Observed replicas keyed by hosting node
    replicas: HashMap<String, Replica>,
    nexus: Option<Nexus>,
    /// True when the volume was adopted from discovery rather than created
    observed: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Derive volume health from the observed nexus and children
fn derive_state(inner: &VolumeInner) -> VolumeState {
    let Some(nexus) = &inner.nexus else {
        // A realized volume without a nexus has lost its data path.
        return if inner.size == 0 {
            VolumeState::Pending
        } else {
            VolumeState::Faulted
        };
    };
    if nexus.state == NexusState::Offline {
        return VolumeState::Offline;
    }
    let online = nexus.online_children() as u32;
    if online == 0 {
        return VolumeState::Faulted;
    }
    if online < inner.spec.replica_count || nexus.rebuilding_children() > 0 {
        return VolumeState::Degraded;
    }
    VolumeState::Healthy
}

enum ViewChange {
    Added,
    Updated,
    Unchanged,
}

/// One managed volume
pub struct Volume {
    uuid: String,
    registry: Arc<Registry>,
    events: EventBus,
    /// Serializes remote operations on this volume
    op_lock: Mutex<()>,
    inner: RwLock<VolumeInner>,
}

impl Volume {
    /// A freshly declared volume, not yet realized anywhere
    pub fn new(
        uuid: impl Into<String>,
        spec: VolumeSpec,
        registry: Arc<Registry>,
        events: EventBus,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            uuid: uuid.into(),
            registry,
            events,
            op_lock: Mutex::new(()),
            inner: RwLock::new(VolumeInner {
                spec,
                size: 0,
                state: VolumeState::Pending,
                replicas: HashMap::new(),
                nexus: None,
                observed: false,
                created_at: now,
                updated_at: now,
            }),
        })
    }

    /// Adopt a volume from objects discovered in the cluster
    ///
    /// The spec is reconstructed from what exists: as many replicas as were
    /// found, sized to match. No remote calls are made.
    pub fn from_observation(
        uuid: impl Into<String>,
        replicas: Vec<Replica>,
        nexus: Option<Nexus>,
        registry: Arc<Registry>,
        events: EventBus,
    ) -> Arc<Self> {
        let size = nexus
            .as_ref()
            .map(|n| n.size)
            .or_else(|| replicas.first().map(|r| r.size))
            .unwrap_or(0);
        let spec = VolumeSpec {
            replica_count: (replicas.len() as u32).max(1),
            required_bytes: size,
            ..Default::default()
        };
        let now = Utc::now();
        let mut inner = VolumeInner {
            spec,
            size,
            state: VolumeState::Pending,
            replicas: replicas.into_iter().map(|r| (r.node.clone(), r)).collect(),
            nexus,
            observed: true,
            created_at: now,
            updated_at: now,
        };
        inner.state = derive_state(&inner);
        Arc::new(Self {
            uuid: uuid.into(),
            registry,
            events,
            op_lock: Mutex::new(()),
            inner: RwLock::new(inner),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> VolumeState {
        self.inner.read().state
    }

    pub fn size(&self) -> u64 {
        self.inner.read().size
    }

    pub fn spec(&self) -> VolumeSpec {
        self.inner.read().spec.clone()
    }

    pub fn snapshot(&self) -> VolumeSnapshot {
        self.make_snapshot(&self.inner.read())
    }

    pub fn device_path(&self) -> Option<String> {
        self.inner
            .read()
            .nexus
            .as_ref()
            .and_then(|n| n.device_path.clone())
    }

    /// Node currently hosting the nexus, if any
    pub fn nexus_node(&self) -> Option<String> {
        self.inner.read().nexus.as_ref().map(|n| n.node.clone())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Realize the volume, or reconcile the spec of one already realized
    pub async fn create(&self, spec: &VolumeSpec) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.create_locked(spec).await
    }

    async fn create_locked(&self, spec: &VolumeSpec) -> Result<()> {
        spec.validate()?;

        if self.inner.read().size > 0 {
            return self.reconcile_spec(spec);
        }

        let target = spec.target_size();
        let candidates =
            self.registry
                .choose_pools(target, &spec.preferred_nodes, &spec.required_nodes);

        // One replica per node; candidates arrive best-first.
        let mut placements: Vec<PoolCandidate> = Vec::new();
        for candidate in candidates {
            if placements.len() as u32 == spec.replica_count {
                break;
            }
            if placements.iter().any(|p| p.node == candidate.node) {
                continue;
            }
            placements.push(candidate);
        }
        if (placements.len() as u32) < spec.replica_count {
            return Err(Error::InsufficientStorage {
                uuid: self.uuid.clone(),
                requested: target,
                replicas: spec.replica_count,
            });
        }

        // Adopt the spec before any remote call so a failed create leaves
        // an inspectable volume behind.
        {
            let mut inner = self.inner.write();
            inner.spec = spec.clone();
            inner.updated_at = Utc::now();
        }

        info!(
            volume = %self.uuid,
            replicas = spec.replica_count,
            size = target,
            "Creating volume"
        );

        let mut calls = Vec::new();
        for placement in &placements {
            let client = self.registry.node_client(&placement.node)?;
            let uuid = self.uuid.clone();
            let pool = placement.pool.clone();
            let node = placement.node.clone();
            calls.push(async move {
                let result = client
                    .create_replica(&uuid, &pool, target, false, ShareProtocol::None)
                    .await;
                (node, result)
            });
        }

        let mut created: Vec<Replica> = Vec::new();
        let mut first_error: Option<Error> = None;
        for (node, result) in join_all(calls).await {
            match result {
                Ok(replica) => created.push(replica),
                Err(error) => {
                    warn!(volume = %self.uuid, node = %node, %error, "Replica create failed");
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        if created.is_empty() {
            return Err(
                first_error.unwrap_or_else(|| Error::Internal("no replicas created".into()))
            );
        }

        for replica in &created {
            self.registry.insert_replica(replica.clone());
        }
        {
            let mut inner = self.inner.write();
            inner.size = target;
            for replica in created.clone() {
                self.attach_replica(&mut inner, replica);
            }
        }

        // The nexus sits beside the first replica; remote replicas are
        // shared over nvmf so it can reach them.
        let nexus_node = created[0].node.clone();
        let mut children = Vec::new();
        for replica in &created {
            if replica.node == nexus_node {
                children.push(replica.uri.clone());
            } else {
                match self.share_replica_for_nexus(replica).await {
                    Ok(uri) => children.push(uri),
                    Err(error) => {
                        warn!(
                            volume = %self.uuid,
                            node = %replica.node,
                            %error,
                            "Replica share failed, leaving it out of the nexus"
                        );
                    }
                }
            }
        }

        let client = self.registry.node_client(&nexus_node)?;
        let nexus = match client.create_nexus(&self.uuid, target, &children).await {
            Ok(nexus) => nexus,
            Err(error) => {
                let mut inner = self.inner.write();
                self.recompute_state(&mut inner);
                return Err(error);
            }
        };

        self.registry.insert_nexus(nexus.clone());
        {
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, nexus);
            self.recompute_state(&mut inner);
        }
        Ok(())
    }

    /// Fold a re-submitted spec into an already realized volume
    fn reconcile_spec(&self, spec: &VolumeSpec) -> Result<()> {
        let mut inner = self.inner.write();
        if spec.required_bytes > inner.size {
            return Err(Error::VolumeExtend {
                uuid: self.uuid.clone(),
                current: inner.size,
                requested: spec.required_bytes,
            });
        }
        if spec.limit_bytes != 0 && spec.limit_bytes < inner.size {
            return Err(Error::VolumeShrink {
                uuid: self.uuid.clone(),
                current: inner.size,
                requested: spec.limit_bytes,
            });
        }
        if inner.spec == *spec {
            return Ok(());
        }
        info!(volume = %self.uuid, "Adopting updated spec");
        inner.spec = spec.clone();
        inner.updated_at = Utc::now();
        // One mod carries both the new spec and any resulting state change.
        if !self.recompute_state(&mut inner) {
            self.publish_volume(&inner, EventKind::Mod);
        }
        Ok(())
    }

    /// Tear the volume down across the cluster
    ///
    /// Best effort: unreachable nodes are logged and skipped, bookkeeping
    /// is completed regardless so a later create starts clean.
    pub async fn destroy(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let (replicas, nexus) = {
            let inner = self.inner.read();
            (
                inner.replicas.values().cloned().collect::<Vec<_>>(),
                inner.nexus.clone(),
            )
        };

        info!(volume = %self.uuid, replicas = replicas.len(), "Destroying volume");

        // The nexus goes first so the data path is gone before its backing
        // replicas disappear.
        if let Some(nexus) = nexus {
            match self.registry.node_client(&nexus.node) {
                Ok(client) => {
                    if let Err(error) = client.destroy_nexus(&self.uuid).await {
                        warn!(
                            volume = %self.uuid,
                            node = %nexus.node,
                            %error,
                            "Nexus destroy failed, continuing teardown"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        volume = %self.uuid,
                        node = %nexus.node,
                        %error,
                        "Nexus node unreachable, continuing teardown"
                    );
                }
            }
            self.registry.remove_nexus(&nexus.node, &self.uuid);
            let mut inner = self.inner.write();
            self.detach_nexus(&mut inner);
        }

        let mut replicas: Vec<Replica> = replicas;
        replicas.sort_by(|a, b| a.node.cmp(&b.node));
        for replica in replicas {
            match self.registry.node_client(&replica.node) {
                Ok(client) => {
                    if let Err(error) = client.destroy_replica(&self.uuid).await {
                        warn!(
                            volume = %self.uuid,
                            node = %replica.node,
                            %error,
                            "Replica destroy failed, continuing teardown"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        volume = %self.uuid,
                        node = %replica.node,
                        %error,
                        "Replica node unreachable, continuing teardown"
                    );
                }
            }
            self.registry
                .remove_replica(&replica.node, &replica.pool, &replica.uuid);
            let mut inner = self.inner.write();
            self.detach_replica(&mut inner, &replica.node);
        }

        // Quiet reset; retiring the volume object is the manager's call.
        let mut inner = self.inner.write();
        inner.size = 0;
        inner.state = VolumeState::Pending;
        inner.updated_at = Utc::now();
        Ok(())
    }

    /// Expose the volume to the host, returning the block device path
    pub async fn publish(&self, share: ShareProtocol) -> Result<String> {
        let _guard = self.op_lock.lock().await;

        let nexus = {
            let inner = self.inner.read();
            let nexus = inner.nexus.clone().ok_or_else(|| Error::NexusMissing {
                uuid: self.uuid.clone(),
            })?;
            if let Some(device) = &nexus.device_path {
                return Err(Error::AlreadyPublished {
                    uuid: self.uuid.clone(),
                    device: device.clone(),
                });
            }
            nexus
        };

        let client = self.registry.node_client(&nexus.node)?;
        let device = client.publish_nexus(&self.uuid, "").await?;

        let mut published = nexus;
        published.device_path = Some(device.clone());
        published.share = share;
        self.registry.insert_nexus(published.clone());
        {
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, published);
        }

        info!(volume = %self.uuid, device = %device, "Volume published");
        Ok(device)
    }

    /// Withdraw the volume from the host; a no-op when not published
    pub async fn unpublish(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let nexus = {
            let inner = self.inner.read();
            match &inner.nexus {
                Some(nexus) if nexus.is_published() => nexus.clone(),
                _ => return Ok(()),
            }
        };

        let client = self.registry.node_client(&nexus.node)?;
        client.unpublish_nexus(&self.uuid).await?;

        let mut cleared = nexus;
        cleared.device_path = None;
        cleared.share = ShareProtocol::None;
        self.registry.insert_nexus(cleared.clone());
        {
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, cleared);
        }
        info!(volume = %self.uuid, "Volume unpublished");
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Nudge the observed child count toward the spec's replica count
    ///
    /// At most one replica is added or removed per call; the engine never
    /// retries on its own, the next tick or topology change does.
    pub async fn reconcile(&self) -> Result<()> {
        let Ok(_guard) = self.op_lock.try_lock() else {
            debug!(volume = %self.uuid, "Reconcile skipped, operation in flight");
            return Ok(());
        };

        let (nexus, replica_count) = {
            let inner = self.inner.read();
            let Some(nexus) = inner.nexus.clone() else {
                return Ok(());
            };
            (nexus, inner.spec.replica_count)
        };
        if !nexus.state.is_mutable() {
            debug!(
                volume = %self.uuid,
                nexus_state = %nexus.state,
                "Reconcile skipped, nexus not mutable"
            );
            return Ok(());
        }
        if nexus.rebuilding_children() > 0 {
            debug!(volume = %self.uuid, "Reconcile skipped, rebuild in progress");
            return Ok(());
        }

        let children = nexus.children.len() as u32;
        if children < replica_count {
            self.scale_up_locked(&nexus).await
        } else if children > replica_count {
            self.scale_down_locked(&nexus).await
        } else {
            Ok(())
        }
    }

    async fn scale_up_locked(&self, nexus: &Nexus) -> Result<()> {
        let (spec, size, occupied) = {
            let inner = self.inner.read();
            (
                inner.spec.clone(),
                inner.size,
                inner.replicas.keys().cloned().collect::<Vec<_>>(),
            )
        };

        let candidates =
            self.registry
                .choose_pools(size, &spec.preferred_nodes, &spec.required_nodes);
        let placement = candidates
            .into_iter()
            .find(|c| !occupied.contains(&c.node))
            .ok_or_else(|| Error::InsufficientStorage {
                uuid: self.uuid.clone(),
                requested: size,
                replicas: spec.replica_count,
            })?;

        info!(
            volume = %self.uuid,
            node = %placement.node,
            pool = %placement.pool,
            "Scaling up"
        );

        let client = self.registry.node_client(&placement.node)?;
        let replica = client
            .create_replica(&self.uuid, &placement.pool, size, false, ShareProtocol::None)
            .await?;
        self.registry.insert_replica(replica.clone());
        {
            let mut inner = self.inner.write();
            self.attach_replica(&mut inner, replica.clone());
        }

        let uri = if replica.node == nexus.node {
            replica.uri.clone()
        } else {
            self.share_replica_for_nexus(&replica).await?
        };

        let nexus_client = self.registry.node_client(&nexus.node)?;
        let child = nexus_client.add_child_nexus(&self.uuid, &uri).await?;

        let mut updated = nexus.clone();
        updated.children.push(child);
        if updated.children.iter().any(|c| !c.is_online()) {
            updated.state = NexusState::Degraded;
        }
        self.registry.insert_nexus(updated.clone());
        {
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, updated);
            self.recompute_state(&mut inner);
        }
        Ok(())
    }

    async fn scale_down_locked(&self, nexus: &Nexus) -> Result<()> {
        let (spec, replicas) = {
            let inner = self.inner.read();
            (
                inner.spec.clone(),
                inner.replicas.values().cloned().collect::<Vec<_>>(),
            )
        };

        // A child no replica backs is dead weight; drop it before touching
        // live replicas.
        if let Some(stale) = nexus
            .children
            .iter()
            .find(|c| !replicas.iter().any(|r| r.uri == c.uri))
        {
            info!(volume = %self.uuid, uri = %stale.uri, "Dropping orphaned child");
            let client = self.registry.node_client(&nexus.node)?;
            client.remove_child_nexus(&self.uuid, &stale.uri).await?;

            let mut updated = nexus.clone();
            updated.children.retain(|c| c.uri != stale.uri);
            if updated.state == NexusState::Degraded
                && updated.children.iter().all(|c| c.is_online())
            {
                updated.state = NexusState::Online;
            }
            self.registry.insert_nexus(updated.clone());
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, updated);
            self.recompute_state(&mut inner);
            return Ok(());
        }

        // Unhealthy children go first, then replicas on non-preferred nodes.
        let victim = replicas
            .into_iter()
            .min_by_key(|replica| {
                let child_rank = match nexus.find_child(&replica.uri).map(|c| c.state) {
                    None => 0u8,
                    Some(ChildState::Faulted) => 1,
                    Some(ChildState::Degraded) => 2,
                    Some(ChildState::Online) => 3,
                };
                let preference = spec
                    .preferred_nodes
                    .iter()
                    .position(|n| *n == replica.node)
                    .unwrap_or(usize::MAX);
                (child_rank, Reverse(preference), replica.node.clone())
            });
        let Some(victim) = victim else {
            return Ok(());
        };

        info!(volume = %self.uuid, node = %victim.node, "Scaling down");

        let nexus_client = self.registry.node_client(&nexus.node)?;
        nexus_client
            .remove_child_nexus(&self.uuid, &victim.uri)
            .await?;

        let mut updated = nexus.clone();
        updated.children.retain(|c| c.uri != victim.uri);
        if updated.state == NexusState::Degraded && updated.children.iter().all(|c| c.is_online())
        {
            updated.state = NexusState::Online;
        }
        self.registry.insert_nexus(updated.clone());
        {
            let mut inner = self.inner.write();
            self.attach_nexus(&mut inner, updated);
        }

        match self.registry.node_client(&victim.node) {
            Ok(client) => {
                if let Err(error) = client.destroy_replica(&self.uuid).await {
                    warn!(
                        volume = %self.uuid,
                        node = %victim.node,
                        %error,
                        "Replica destroy failed after detach"
                    );
                }
            }
            Err(error) => {
                warn!(
                    volume = %self.uuid,
                    node = %victim.node,
                    %error,
                    "Replica node unreachable after detach"
                );
            }
        }
        self.registry
            .remove_replica(&victim.node, &victim.pool, &victim.uuid);
        {
            let mut inner = self.inner.write();
            self.detach_replica(&mut inner, &victim.node);
            self.recompute_state(&mut inner);
        }
        Ok(())
    }

    /// Share a replica over nvmf so a remote nexus can reach it
    async fn share_replica_for_nexus(&self, replica: &Replica) -> Result<String> {
        let client = self.registry.node_client(&replica.node)?;
        let uri = client
            .share_replica(&replica.uuid, ShareProtocol::Nvmf)
            .await?;

        let mut shared = replica.clone();
        shared.share = ShareProtocol::Nvmf;
        shared.uri = uri.clone();
        self.registry.insert_replica(shared.clone());
        {
            let mut inner = self.inner.write();
            self.attach_replica(&mut inner, shared);
        }
        Ok(uri)
    }

    // =========================================================================
    // Observation Hooks
    // =========================================================================

    /// Fold a discovered or changed replica into the view
    pub fn new_replica(&self, replica: Replica) {
        let mut inner = self.inner.write();
        if inner.size == 0 {
            inner.size = replica.size;
        }
        self.attach_replica(&mut inner, replica);
        if inner.observed && inner.replicas.len() as u32 > inner.spec.replica_count {
            // An adopted spec grows to cover what actually exists.
            inner.spec.replica_count = inner.replicas.len() as u32;
        }
        self.recompute_state(&mut inner);
    }

    /// A replica on the given node is gone from the cluster
    pub fn replica_gone(&self, node: &str) {
        let mut inner = self.inner.write();
        self.detach_replica(&mut inner, node);
        self.recompute_state(&mut inner);
    }

    /// Fold a discovered or changed nexus into the view
    pub fn new_nexus(&self, nexus: Nexus) {
        let mut inner = self.inner.write();
        if inner.size == 0 {
            inner.size = nexus.size;
        }
        self.attach_nexus(&mut inner, nexus);
        self.recompute_state(&mut inner);
    }

    /// The nexus is gone from the cluster
    pub fn nexus_gone(&self) {
        let mut inner = self.inner.write();
        self.detach_nexus(&mut inner);
        self.recompute_state(&mut inner);
    }

    /// The node hosting the nexus stopped responding
    pub fn nexus_unreachable(&self) {
        let mut inner = self.inner.write();
        let changed = match &mut inner.nexus {
            Some(nexus) if nexus.state != NexusState::Offline => {
                nexus.state = NexusState::Offline;
                Some(nexus.clone())
            }
            _ => None,
        };
        if let Some(nexus) = changed {
            inner.updated_at = Utc::now();
            self.events.publish(EventKind::Mod, EventObject::Nexus(nexus));
        }
        self.recompute_state(&mut inner);
    }

    // =========================================================================
    // View Bookkeeping
    // =========================================================================

    fn attach_replica(&self, inner: &mut VolumeInner, replica: Replica) {
        let change = match inner.replicas.get(&replica.node) {
            Some(existing) if *existing == replica => ViewChange::Unchanged,
            Some(_) => ViewChange::Updated,
            None => ViewChange::Added,
        };
        let kind = match change {
            ViewChange::Unchanged => return,
            ViewChange::Added => EventKind::New,
            ViewChange::Updated => EventKind::Mod,
        };
        inner.replicas.insert(replica.node.clone(), replica.clone());
        inner.updated_at = Utc::now();
        self.events.publish(kind, EventObject::Replica(replica));
    }

    fn detach_replica(&self, inner: &mut VolumeInner, node: &str) {
        if let Some(replica) = inner.replicas.remove(node) {
            inner.updated_at = Utc::now();
            self.events.publish(EventKind::Del, EventObject::Replica(replica));
        }
    }

    fn attach_nexus(&self, inner: &mut VolumeInner, nexus: Nexus) {
        let change = match &inner.nexus {
            Some(existing) if *existing == nexus => ViewChange::Unchanged,
            Some(_) => ViewChange::Updated,
            None => ViewChange::Added,
        };
        let kind = match change {
            ViewChange::Unchanged => return,
            ViewChange::Added => EventKind::New,
            ViewChange::Updated => EventKind::Mod,
        };
        inner.nexus = Some(nexus.clone());
        inner.updated_at = Utc::now();
        self.events.publish(kind, EventObject::Nexus(nexus));
    }

    fn detach_nexus(&self, inner: &mut VolumeInner) {
        if let Some(nexus) = inner.nexus.take() {
            inner.updated_at = Utc::now();
            self.events.publish(EventKind::Del, EventObject::Nexus(nexus));
        }
    }

    fn recompute_state(&self, inner: &mut VolumeInner) -> bool {
        let next = derive_state(inner);
        if next == inner.state {
            return false;
        }
        let previous = inner.state;
        inner.state = next;
        inner.updated_at = Utc::now();
        info!(volume = %self.uuid, from = %previous, to = %next, "Volume state changed");
        self.publish_volume(inner, EventKind::Mod);
        true
    }

    fn make_snapshot(&self, inner: &VolumeInner) -> VolumeSnapshot {
        VolumeSnapshot {
            uuid: self.uuid.clone(),
            spec: inner.spec.clone(),
            size: inner.size,
            state: inner.state,
            replicas: inner.replicas.clone(),
            nexus: inner.nexus.clone(),
            created_at: inner.created_at,
            updated_at: inner.updated_at,
        }
    }

    fn publish_volume(&self, inner: &VolumeInner, kind: EventKind) {
        self.events
            .publish(kind, EventObject::Volume(self.make_snapshot(inner)));
    }

    /// Emit a lifecycle event carrying the current snapshot
    pub(crate) fn publish_volume_event(&self, kind: EventKind) {
        let inner = self.inner.read();
        self.publish_volume(&inner, kind);
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Child;

    fn inner_with(replica_count: u32, size: u64, nexus: Option<Nexus>) -> VolumeInner {
        let now = Utc::now();
        VolumeInner {
            spec: VolumeSpec {
                replica_count,
                required_bytes: size,
                ..Default::default()
            },
            size,
            state: VolumeState::Pending,
            replicas: HashMap::new(),
            nexus,
            observed: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn nexus_with(state: NexusState, children: &[ChildState]) -> Nexus {
        Nexus {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            size: 100,
            state,
            children: children
                .iter()
                .enumerate()
                .map(|(i, state)| Child {
                    uri: format!("bdev:///child-{}", i),
                    state: *state,
                })
                .collect(),
            device_path: None,
            share: ShareProtocol::None,
        }
    }

    #[test]
    fn test_unrealized_volume_is_pending() {
        assert_eq!(derive_state(&inner_with(2, 0, None)), VolumeState::Pending);
    }

    #[test]
    fn test_realized_volume_without_nexus_is_faulted() {
        // Losing the nexus after data exists is never a return to pending.
        assert_eq!(derive_state(&inner_with(2, 100, None)), VolumeState::Faulted);
    }

    #[test]
    fn test_offline_nexus_is_offline() {
        let nexus = nexus_with(NexusState::Offline, &[ChildState::Online]);
        assert_eq!(
            derive_state(&inner_with(1, 100, Some(nexus))),
            VolumeState::Offline
        );
    }

    #[test]
    fn test_full_redundancy_is_healthy() {
        let nexus = nexus_with(NexusState::Online, &[ChildState::Online, ChildState::Online]);
        assert_eq!(
            derive_state(&inner_with(2, 100, Some(nexus))),
            VolumeState::Healthy
        );
    }

    #[test]
    fn test_missing_redundancy_is_degraded() {
        let nexus = nexus_with(NexusState::Online, &[ChildState::Online]);
        assert_eq!(
            derive_state(&inner_with(2, 100, Some(nexus))),
            VolumeState::Degraded
        );

        let nexus = nexus_with(
            NexusState::Degraded,
            &[ChildState::Online, ChildState::Faulted],
        );
        assert_eq!(
            derive_state(&inner_with(2, 100, Some(nexus))),
            VolumeState::Degraded
        );
    }

    #[test]
    fn test_rebuilding_child_is_degraded() {
        // Enough children, but one still syncing.
        let nexus = nexus_with(
            NexusState::Degraded,
            &[ChildState::Online, ChildState::Online, ChildState::Degraded],
        );
        assert_eq!(
            derive_state(&inner_with(2, 100, Some(nexus))),
            VolumeState::Degraded
        );
    }

    #[test]
    fn test_no_online_children_is_faulted() {
        let nexus = nexus_with(NexusState::Degraded, &[ChildState::Faulted]);
        assert_eq!(
            derive_state(&inner_with(1, 100, Some(nexus))),
            VolumeState::Faulted
        );

        let nexus = nexus_with(
            NexusState::Degraded,
            &[ChildState::Faulted, ChildState::Degraded],
        );
        assert_eq!(
            derive_state(&inner_with(2, 100, Some(nexus))),
            VolumeState::Faulted
        );
    }

    #[test]
    fn test_volume_state_availability() {
        assert!(VolumeState::Healthy.is_available());
        assert!(VolumeState::Degraded.is_available());
        assert!(!VolumeState::Pending.is_available());
        assert!(!VolumeState::Faulted.is_available());
        assert!(!VolumeState::Offline.is_available());
    }

    #[test]
    fn test_observation_reconstructs_spec() {
        let registry = Registry::new();
        let replica = Replica {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            pool: "pool-1".into(),
            size: 100,
            thin: false,
            share: ShareProtocol::None,
            uri: "bdev:///vol-1".into(),
        };
        let volume = Volume::from_observation(
            "vol-1",
            vec![replica],
            None,
            registry,
            EventBus::new(),
        );
        let spec = volume.spec();
        assert_eq!(spec.replica_count, 1);
        assert_eq!(spec.required_bytes, 100);
        assert_eq!(volume.size(), 100);
        // Replicas but no nexus: the data path is lost, not pending.
        assert_eq!(volume.state(), VolumeState::Faulted);
    }
}
