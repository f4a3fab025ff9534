//! Volume Manager
//!
//! The single entry point for volume lifecycle. Owns the set of managed
//! volumes, folds topology changes into them, and drives periodic
//! reconciliation. Volumes found in the cluster that the manager never
//! created are adopted with a spec reconstructed from what exists.

use crate::error::Result;
use crate::topology::{Registry, TopologyEvent};
use crate::volume::events::{EventBus, EventKind, VolumeEvent};
use crate::volume::spec::VolumeSpec;
use crate::volume::volume::{Volume, VolumeSnapshot, VolumeState};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Volume manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How often every volume is reconciled against its spec
    pub reconcile_interval: Duration,
    /// Whether the reconcile tick re-lists objects from node agents first
    pub refresh_from_agents: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            refresh_from_agents: true,
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Volume counts by state plus lifetime create/destroy totals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
    pub volumes: u64,
    pub healthy: u64,
    pub degraded: u64,
    pub faulted: u64,
    pub offline: u64,
    pub pending: u64,
    pub created_total: u64,
    pub destroyed_total: u64,
}

// =============================================================================
// Volume Manager
// =============================================================================

/// Owner of all managed volumes
pub struct VolumeManager {
    config: ManagerConfig,
    registry: Arc<Registry>,
    events: EventBus,
    volumes: DashMap<String, Arc<Volume>>,
    created: AtomicU64,
    destroyed: AtomicU64,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VolumeManager {
    pub fn new(config: ManagerConfig, registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            events: EventBus::new(),
            volumes: DashMap::new(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Get a lifecycle event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<VolumeEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // =========================================================================
    // Lifecycle Entry Points
    // =========================================================================

    /// Create a volume, or reconcile the spec of one that already exists
    ///
    /// A create that fails retires the volume again, so callers observe a
    /// `new` followed by a `del` and no half-made object stays behind.
    pub async fn create_volume(&self, uuid: &str, spec: VolumeSpec) -> Result<Arc<Volume>> {
        if let Some(existing) = self.volumes.get(uuid).map(|v| v.value().clone()) {
            existing.create(&spec).await?;
            return Ok(existing);
        }

        let fresh = Volume::new(uuid, spec.clone(), self.registry.clone(), self.events.clone());
        let (volume, inserted) = match self.volumes.entry(uuid.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                (fresh, true)
            }
        };
        if !inserted {
            // Lost the insert race; fold the spec into the winner.
            volume.create(&spec).await?;
            return Ok(volume);
        }

        volume.publish_volume_event(EventKind::New);

        if let Err(err) = volume.create(&spec).await {
            error!(volume = %uuid, error = %err, "Volume create failed, retiring volume");
            if let Err(teardown) = volume.destroy().await {
                warn!(
                    volume = %uuid,
                    error = %teardown,
                    "Teardown after failed create also failed"
                );
            }
            self.volumes.remove(uuid);
            volume.publish_volume_event(EventKind::Del);
            return Err(err);
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(volume)
    }

    /// Destroy a volume; unknown UUIDs succeed without side effects
    pub async fn destroy_volume(&self, uuid: &str) -> Result<()> {
        let Some(volume) = self.volumes.get(uuid).map(|v| v.value().clone()) else {
            debug!(volume = %uuid, "Destroy for unknown volume");
            return Ok(());
        };
        volume.destroy().await?;
        self.volumes.remove(uuid);
        volume.publish_volume_event(EventKind::Del);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn volume(&self, uuid: &str) -> Option<Arc<Volume>> {
        self.volumes.get(uuid).map(|v| v.value().clone())
    }

    pub fn list_volumes(&self) -> Vec<VolumeSnapshot> {
        let mut snapshots: Vec<VolumeSnapshot> = self
            .volumes
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        snapshots
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn status(&self) -> ManagerStatus {
        let mut status = ManagerStatus {
            volumes: 0,
            healthy: 0,
            degraded: 0,
            faulted: 0,
            offline: 0,
            pending: 0,
            created_total: self.created.load(Ordering::Relaxed),
            destroyed_total: self.destroyed.load(Ordering::Relaxed),
        };
        for entry in self.volumes.iter() {
            status.volumes += 1;
            match entry.value().state() {
                VolumeState::Healthy => status.healthy += 1,
                VolumeState::Degraded => status.degraded += 1,
                VolumeState::Faulted => status.faulted += 1,
                VolumeState::Offline => status.offline += 1,
                VolumeState::Pending => status.pending += 1,
            }
        }
        status
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Spawn the topology listener and the reconcile ticker
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Volume manager already started");
            return;
        }

        let manager = self.clone();
        let token = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut events = manager.registry.subscribe();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => manager.handle_topology_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Topology listener lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Topology listener stopped");
        }));

        let manager = self.clone();
        let token = self.shutdown.clone();
        let period = self.config.reconcile_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.reconcile_all().await,
                }
            }
            debug!("Reconciler stopped");
        }));

        info!(interval = ?self.config.reconcile_interval, "Volume manager started");
    }

    /// Cancel background tasks and wait for them to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task join failed");
            }
        }
        info!("Volume manager stopped");
    }

    // =========================================================================
    // Topology Handling
    // =========================================================================

    async fn handle_topology_event(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::ReplicaAdded { replica } | TopologyEvent::ReplicaChanged { replica } => {
                if let Some(volume) = self.volume_for(&replica.uuid) {
                    volume.new_replica(replica);
                    if let Err(err) = volume.reconcile().await {
                        warn!(
                            volume = %volume.uuid(),
                            error = %err,
                            "Reconcile after replica change failed"
                        );
                    }
                }
            }
            TopologyEvent::ReplicaRemoved { replica } => {
                if let Some(volume) = self.volume(&replica.uuid) {
                    volume.replica_gone(&replica.node);
                    if let Err(err) = volume.reconcile().await {
                        warn!(
                            volume = %volume.uuid(),
                            error = %err,
                            "Reconcile after replica removal failed"
                        );
                    }
                }
            }
            TopologyEvent::NexusAdded { nexus } | TopologyEvent::NexusChanged { nexus } => {
                if let Some(volume) = self.volume_for(&nexus.uuid) {
                    volume.new_nexus(nexus);
                    if let Err(err) = volume.reconcile().await {
                        warn!(
                            volume = %volume.uuid(),
                            error = %err,
                            "Reconcile after nexus change failed"
                        );
                    }
                }
            }
            TopologyEvent::NexusRemoved { nexus } => {
                if let Some(volume) = self.volume(&nexus.uuid) {
                    volume.nexus_gone();
                }
            }
            TopologyEvent::NodeOffline { node } => {
                let volumes: Vec<Arc<Volume>> = self
                    .volumes
                    .iter()
                    .map(|entry| entry.value().clone())
                    .collect();
                for volume in volumes {
                    if volume.nexus_node().as_deref() == Some(node.as_str()) {
                        volume.nexus_unreachable();
                    }
                }
            }
            TopologyEvent::NodeOnline { node } => {
                if self.config.refresh_from_agents {
                    self.refresh_node(&node).await;
                }
            }
            _ => {}
        }
    }

    /// Find the volume owning a discovered object, adopting one if needed
    ///
    /// Adoption reads the registry, never the agents; if the registry no
    /// longer holds anything for the UUID there is nothing to adopt.
    fn volume_for(&self, uuid: &str) -> Option<Arc<Volume>> {
        if let Some(existing) = self.volumes.get(uuid) {
            return Some(existing.value().clone());
        }
        let replicas = self.registry.replica_set(uuid);
        let nexus = self.registry.lookup_nexus(uuid);
        if replicas.is_empty() && nexus.is_none() {
            return None;
        }

        let fresh = Volume::from_observation(
            uuid,
            replicas,
            nexus,
            self.registry.clone(),
            self.events.clone(),
        );
        let (volume, inserted) = match self.volumes.entry(uuid.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                entry.insert(fresh.clone());
                (fresh, true)
            }
        };
        if inserted {
            info!(volume = %uuid, state = %volume.state(), "Adopted volume from discovered objects");
            volume.publish_volume_event(EventKind::New);
        }
        Some(volume)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// One full pass: optionally refresh from agents, then reconcile all
    pub async fn reconcile_all(&self) {
        if self.config.refresh_from_agents {
            for node in self.registry.node_names() {
                self.refresh_node(&node).await;
            }
        }
        let volumes: Vec<Arc<Volume>> = self
            .volumes
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for volume in volumes {
            if let Err(err) = volume.reconcile().await {
                warn!(volume = %volume.uuid(), error = %err, "Reconcile failed");
            }
        }
    }

    /// Re-list one node's objects and fold them into the registry
    async fn refresh_node(&self, node: &str) {
        let client = match self.registry.node_client(node) {
            Ok(client) => client,
            Err(err) => {
                debug!(node = %node, error = %err, "Skipping refresh");
                return;
            }
        };
        let replicas = match client.list_replicas().await {
            Ok(replicas) => replicas,
            Err(err) => {
                debug!(node = %node, error = %err, "Replica listing failed");
                return;
            }
        };
        let nexuses = match client.list_nexus().await {
            Ok(nexuses) => nexuses,
            Err(err) => {
                debug!(node = %node, error = %err, "Nexus listing failed");
                return;
            }
        };
        self.registry.apply_node_report(node, replicas, nexuses);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{OpLog, SimAgent};
    use crate::error::{Error, ErrorKind};
    use crate::topology::{Child, ChildState, Nexus, NexusState, Replica, ShareProtocol};
    use crate::volume::events::EventObject;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    struct TestCluster {
        registry: Arc<Registry>,
        manager: Arc<VolumeManager>,
        agents: HashMap<String, Arc<SimAgent>>,
        log: OpLog,
    }

    async fn cluster(nodes: &[(&str, u64)]) -> TestCluster {
        let registry = Registry::new();
        let log = OpLog::new();
        let mut agents = HashMap::new();
        for (name, capacity) in nodes {
            let agent = Arc::new(SimAgent::new(*name, log.clone()));
            agent.add_pool(&format!("pool-{}", name), *capacity).await;
            registry
                .register_node(name, agent.clone(), agent.pool_reports().await)
                .unwrap();
            agents.insert(name.to_string(), agent);
        }
        let manager = VolumeManager::new(
            ManagerConfig {
                reconcile_interval: Duration::from_secs(3600),
                refresh_from_agents: false,
            },
            registry.clone(),
        );
        TestCluster {
            registry,
            manager,
            agents,
            log,
        }
    }

    fn spec(replica_count: u32, required_bytes: u64) -> VolumeSpec {
        VolumeSpec {
            replica_count,
            required_bytes,
            ..Default::default()
        }
    }

    fn drain(receiver: &mut broadcast::Receiver<VolumeEvent>) -> Vec<VolumeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Process pending topology events the way the listener task would
    async fn drain_topology(
        manager: &Arc<VolumeManager>,
        receiver: &mut broadcast::Receiver<TopologyEvent>,
    ) {
        while let Ok(event) = receiver.try_recv() {
            manager.handle_topology_event(event).await;
        }
    }

    #[tokio::test]
    async fn test_create_places_replicas_and_nexus() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;

        let volume = c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();

        assert_eq!(c.log.count("create_replica"), 3);
        assert_eq!(c.log.count("create_nexus"), 1);
        // Two replicas are remote to the nexus and get shared.
        assert_eq!(c.log.count("share_replica"), 2);

        assert_eq!(volume.state(), VolumeState::Healthy);
        assert_eq!(volume.size(), 100);
        assert_eq!(c.registry.replica_set("vol-1").len(), 3);
        assert!(c.registry.lookup_nexus("vol-1").is_some());

        let status = c.manager.status();
        assert_eq!(status.volumes, 1);
        assert_eq!(status.healthy, 1);
        assert_eq!(status.created_total, 1);
    }

    #[tokio::test]
    async fn test_limit_bytes_sets_provisioned_size() {
        let c = cluster(&[("node-1", 1000)]).await;
        let volume = c
            .manager
            .create_volume(
                "vol-1",
                VolumeSpec {
                    replica_count: 1,
                    required_bytes: 10,
                    limit_bytes: 50,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(volume.size(), 50);
        assert_eq!(c.registry.replica_set("vol-1")[0].size, 50);
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected_without_calls() {
        let c = cluster(&[("node-1", 1000)]).await;
        let mut events = c.manager.subscribe();

        let err = c
            .manager
            .create_volume("vol-1", spec(1, 0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert!(c.log.is_empty());
        assert_eq!(c.manager.volume_count(), 0);

        // The volume flashes into and out of existence.
        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::New);
        assert!(matches!(events[0].object, EventObject::Volume(_)));
        assert_eq!(events[1].kind, EventKind::Del);
        assert!(matches!(events[1].object, EventObject::Volume(_)));
    }

    #[tokio::test]
    async fn test_unsatisfiable_placement_is_exhausted() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        let mut events = c.manager.subscribe();

        // Three distinct nodes cannot come out of a two node cluster.
        let err = c
            .manager
            .create_volume("vol-1", spec(3, 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(c.log.is_empty());
        assert_eq!(c.manager.volume_count(), 0);

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::New);
        assert_eq!(events[1].kind, EventKind::Del);

        // Restricting to an unknown node fails the same way.
        let err = c
            .manager
            .create_volume(
                "vol-2",
                VolumeSpec {
                    replica_count: 1,
                    required_bytes: 100,
                    required_nodes: vec!["node-9".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert!(c.log.is_empty());
    }

    #[tokio::test]
    async fn test_required_nodes_constrain_placement() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;

        let volume = c
            .manager
            .create_volume(
                "vol-1",
                VolumeSpec {
                    replica_count: 2,
                    required_bytes: 100,
                    required_nodes: vec!["node-2".into(), "node-3".into()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(volume.state(), VolumeState::Healthy);
        let mut nodes: Vec<String> = c
            .registry
            .replica_set("vol-1")
            .into_iter()
            .map(|r| r.node)
            .collect();
        nodes.sort();
        assert_eq!(nodes, vec!["node-2".to_string(), "node-3".to_string()]);
    }

    #[tokio::test]
    async fn test_identical_recreate_is_a_noop() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        let first = c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();

        let ops = c.log.len();
        let mut events = c.manager.subscribe();

        let second = c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(c.log.len(), ops);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_resize_on_recreate_rejected() {
        let c = cluster(&[("node-1", 1000)]).await;
        c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();

        // Growing is not supported in place.
        let err = c
            .manager
            .create_volume("vol-1", spec(1, 200))
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeExtend { .. });
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // Neither is shrinking via a lower limit.
        let err = c
            .manager
            .create_volume(
                "vol-1",
                VolumeSpec {
                    replica_count: 1,
                    required_bytes: 50,
                    limit_bytes: 50,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::VolumeShrink { .. });

        // The volume is untouched.
        let volume = c.manager.volume("vol-1").unwrap();
        assert_eq!(volume.size(), 100);
        assert_eq!(volume.state(), VolumeState::Healthy);
    }

    #[tokio::test]
    async fn test_destroy_tears_down_in_order() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;
        c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();

        c.log.clear();
        let mut events = c.manager.subscribe();

        c.manager.destroy_volume("vol-1").await.unwrap();

        assert_eq!(c.log.count("destroy_nexus"), 1);
        assert_eq!(c.log.count("destroy_replica"), 3);

        // The nexus is gone before the first replica is touched.
        let calls = c.log.snapshot();
        let nexus_at = calls.iter().position(|r| r.op == "destroy_nexus").unwrap();
        let replica_at = calls
            .iter()
            .position(|r| r.op == "destroy_replica")
            .unwrap();
        assert!(nexus_at < replica_at);

        // nexus del, three replica dels, volume del.
        let events = drain(&mut events);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].kind, EventKind::Del);
        assert!(matches!(events[0].object, EventObject::Nexus(_)));
        for event in &events[1..4] {
            assert_eq!(event.kind, EventKind::Del);
            assert!(matches!(event.object, EventObject::Replica(_)));
        }
        assert_eq!(events[4].kind, EventKind::Del);
        assert!(matches!(events[4].object, EventObject::Volume(_)));

        assert_eq!(c.manager.volume_count(), 0);
        assert!(c.registry.replica_set("vol-1").is_empty());
        assert!(c.registry.lookup_nexus("vol-1").is_none());
        assert_eq!(c.manager.status().destroyed_total, 1);
    }

    #[tokio::test]
    async fn test_destroy_unknown_volume_is_silent() {
        let c = cluster(&[("node-1", 1000)]).await;
        let mut events = c.manager.subscribe();

        c.manager.destroy_volume("vol-9").await.unwrap();

        assert!(c.log.is_empty());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_destroy_completes_past_failures() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;
        c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();
        c.agents["node-2"].fail_on("destroy_replica").await;

        let mut events = c.manager.subscribe();
        c.manager.destroy_volume("vol-1").await.unwrap();

        // Bookkeeping finished despite the stuck node.
        assert_eq!(c.manager.volume_count(), 0);
        assert!(c.registry.replica_set("vol-1").is_empty());
        assert_eq!(drain(&mut events).len(), 5);
    }

    #[tokio::test]
    async fn test_publish_and_unpublish() {
        let c = cluster(&[("node-1", 1000)]).await;
        let volume = c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();

        let device = volume.publish(ShareProtocol::Nvmf).await.unwrap();
        assert_eq!(device, "/dev/nbd0");
        assert_eq!(volume.device_path().as_deref(), Some("/dev/nbd0"));

        let err = volume.publish(ShareProtocol::Nvmf).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        volume.unpublish().await.unwrap();
        assert!(volume.device_path().is_none());

        // Unpublishing an unpublished volume is a no-op.
        volume.unpublish().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_create_degrades() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;
        c.agents["node-3"].fail_on("create_replica").await;

        let volume = c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();

        // Two of three replicas made it; the volume serves IO degraded.
        assert_eq!(volume.state(), VolumeState::Degraded);
        assert_eq!(c.registry.replica_set("vol-1").len(), 2);
        assert_eq!(c.manager.status().degraded, 1);
    }

    #[tokio::test]
    async fn test_total_create_failure_retires_volume() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        c.agents["node-1"].fail_on("create_replica").await;
        c.agents["node-2"].fail_on("create_replica").await;

        let mut events = c.manager.subscribe();
        let err = c
            .manager
            .create_volume("vol-1", spec(2, 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteCall);
        assert_eq!(c.manager.volume_count(), 0);
        // A create that never succeeded is not counted.
        assert_eq!(c.manager.status().created_total, 0);

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::New);
        assert_eq!(events[1].kind, EventKind::Del);
    }

    #[tokio::test]
    async fn test_adopts_discovered_volumes() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        let mut topology = c.registry.subscribe();

        // A single-replica volume whose only child has faulted.
        c.registry.insert_replica(Replica {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            pool: "pool-node-1".into(),
            size: 100,
            thin: false,
            share: ShareProtocol::None,
            uri: "bdev:///vol-1".into(),
        });
        c.registry.insert_nexus(Nexus {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            size: 100,
            state: NexusState::Degraded,
            children: vec![Child {
                uri: "bdev:///vol-1".into(),
                state: ChildState::Faulted,
            }],
            device_path: None,
            share: ShareProtocol::None,
        });

        // A two-replica volume with one child lost.
        for (node, uri) in [
            ("node-1", "bdev:///vol-2"),
            ("node-2", "nvmf://node-2:8420/nqn.2019-05.io.openebs:vol-2"),
        ] {
            c.registry.insert_replica(Replica {
                uuid: "vol-2".into(),
                node: node.into(),
                pool: format!("pool-{}", node),
                size: 200,
                thin: false,
                share: ShareProtocol::None,
                uri: uri.into(),
            });
        }
        c.registry.insert_nexus(Nexus {
            uuid: "vol-2".into(),
            node: "node-1".into(),
            size: 200,
            state: NexusState::Degraded,
            children: vec![
                Child {
                    uri: "bdev:///vol-2".into(),
                    state: ChildState::Online,
                },
                Child {
                    uri: "nvmf://node-2:8420/nqn.2019-05.io.openebs:vol-2".into(),
                    state: ChildState::Faulted,
                },
            ],
            device_path: None,
            share: ShareProtocol::None,
        });

        drain_topology(&c.manager, &mut topology).await;

        let faulted = c.manager.volume("vol-1").unwrap();
        assert_eq!(faulted.state(), VolumeState::Faulted);
        assert_eq!(faulted.spec().replica_count, 1);
        assert_eq!(faulted.size(), 100);

        let degraded = c.manager.volume("vol-2").unwrap();
        assert_eq!(degraded.state(), VolumeState::Degraded);
        assert_eq!(degraded.spec().replica_count, 2);
        assert_eq!(degraded.size(), 200);

        // Adoption is observation only.
        assert!(c.log.is_empty());
    }

    #[tokio::test]
    async fn test_scale_up_after_replica_count_change() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        let volume = c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();
        assert_eq!(volume.state(), VolumeState::Healthy);

        // Raising the count adopts the spec and leaves the work to reconcile.
        let volume = c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();
        assert_eq!(volume.spec().replica_count, 2);
        assert_eq!(volume.state(), VolumeState::Degraded);
        assert_eq!(c.log.count("create_replica"), 1);

        volume.reconcile().await.unwrap();

        assert_eq!(c.log.count("create_replica"), 2);
        assert_eq!(c.log.count("add_child_nexus"), 1);
        assert_eq!(c.registry.replica_set("vol-1").len(), 2);
        // The new child is still rebuilding.
        assert_eq!(volume.state(), VolumeState::Degraded);

        // Once the rebuild finishes and the agent is re-listed, health returns.
        c.agents["node-1"].rebuild_complete("vol-1").await;
        let mut topology = c.registry.subscribe();
        c.manager.refresh_node("node-1").await;
        drain_topology(&c.manager, &mut topology).await;

        assert_eq!(volume.state(), VolumeState::Healthy);
    }

    #[tokio::test]
    async fn test_scale_down_removes_one_replica() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;
        let volume = c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();

        let volume2 = c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();
        assert!(Arc::ptr_eq(&volume, &volume2));

        volume.reconcile().await.unwrap();

        assert_eq!(c.log.count("remove_child_nexus"), 1);
        assert_eq!(c.log.count("destroy_replica"), 1);
        assert_eq!(c.registry.replica_set("vol-1").len(), 2);
        let nexus = c.registry.lookup_nexus("vol-1").unwrap();
        assert_eq!(nexus.children.len(), 2);
        assert_eq!(volume.state(), VolumeState::Healthy);
    }

    #[tokio::test]
    async fn test_rebuild_suppresses_scaling() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        let volume = c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();

        c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();
        volume.reconcile().await.unwrap();
        // A rebuild is now in progress on the new child.

        // Dropping the count back must not rip the rebuilding child out.
        c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();
        let ops = c.log.len();
        volume.reconcile().await.unwrap();
        assert_eq!(c.log.len(), ops);
        assert_eq!(c.log.count("remove_child_nexus"), 0);

        // Raising it again must not stack another replica either.
        c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();
        let ops = c.log.len();
        volume.reconcile().await.unwrap();
        assert_eq!(c.log.len(), ops);
    }

    #[tokio::test]
    async fn test_node_offline_marks_volume_offline() {
        let c = cluster(&[("node-1", 1000)]).await;
        let volume = c.manager.create_volume("vol-1", spec(1, 100)).await.unwrap();
        assert_eq!(volume.state(), VolumeState::Healthy);

        let mut topology = c.registry.subscribe();
        c.registry.set_node_online("node-1", false).unwrap();
        drain_topology(&c.manager, &mut topology).await;

        assert_eq!(volume.state(), VolumeState::Offline);
        assert_eq!(c.manager.status().offline, 1);
    }

    #[tokio::test]
    async fn test_lifecycle_event_ordering() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000), ("node-3", 1000)]).await;
        let mut events = c.manager.subscribe();

        c.manager.create_volume("vol-1", spec(3, 100)).await.unwrap();

        let events = drain(&mut events);
        assert!(!events.is_empty());

        // The volume announces itself before any of its objects.
        assert_eq!(events[0].kind, EventKind::New);
        assert!(matches!(events[0].object, EventObject::Volume(_)));

        let replica_news = events
            .iter()
            .filter(|e| e.kind == EventKind::New && matches!(e.object, EventObject::Replica(_)))
            .count();
        assert_eq!(replica_news, 3);
        let nexus_news = events
            .iter()
            .filter(|e| e.kind == EventKind::New && matches!(e.object, EventObject::Nexus(_)))
            .count();
        assert_eq!(nexus_news, 1);

        // No object is modified before it was announced.
        let mut seen_replicas = Vec::new();
        let mut seen_nexus = false;
        for event in &events {
            match (&event.kind, &event.object) {
                (EventKind::New, EventObject::Replica(r)) => seen_replicas.push(r.node.clone()),
                (EventKind::Mod, EventObject::Replica(r)) => {
                    assert!(seen_replicas.contains(&r.node))
                }
                (EventKind::New, EventObject::Nexus(_)) => seen_nexus = true,
                (EventKind::Mod, EventObject::Nexus(_)) => assert!(seen_nexus),
                _ => {}
            }
        }

        // The final event is the volume turning healthy.
        match &events.last().unwrap().object {
            EventObject::Volume(snapshot) => {
                assert_eq!(snapshot.state, VolumeState::Healthy);
            }
            other => panic!("unexpected final event object: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let c = cluster(&[("node-1", 1000), ("node-2", 1000)]).await;
        c.manager.start();

        let volume = c.manager.create_volume("vol-1", spec(2, 100)).await.unwrap();
        // Give the listener a moment to chew through the topology stream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(volume.state(), VolumeState::Healthy);

        c.manager.stop().await;
        assert!(c.manager.tasks.lock().is_empty());
    }
}
