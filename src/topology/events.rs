//! Topology Events
//!
//! Internal notifications broadcast by the registry whenever the cluster
//! graph changes. The volume manager consumes these to fold observed state
//! into the volumes it tracks.

use super::nexus::Nexus;
use super::replica::Replica;
use serde::{Deserialize, Serialize};

/// Events broadcast by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyEvent {
    /// A node joined the cluster
    NodeRegistered { node: String },

    /// A node left the cluster, taking its objects with it
    NodeUnregistered { node: String },

    /// A node became reachable again
    NodeOnline { node: String },

    /// A node stopped responding
    NodeOffline { node: String },

    /// A pool appeared on a node
    PoolAdded { node: String, pool: String },

    /// A pool's capacity or health changed
    PoolChanged { node: String, pool: String },

    /// A pool disappeared from a node
    PoolRemoved { node: String, pool: String },

    /// A replica appeared on a pool
    ReplicaAdded { replica: Replica },

    /// A replica's share or URI changed
    ReplicaChanged { replica: Replica },

    /// A replica disappeared
    ReplicaRemoved { replica: Replica },

    /// A nexus appeared on a node
    NexusAdded { nexus: Nexus },

    /// A nexus's children, health or device path changed
    NexusChanged { nexus: Nexus },

    /// A nexus disappeared
    NexusRemoved { nexus: Nexus },
}

impl TopologyEvent {
    /// Node the event originated on
    pub fn node(&self) -> &str {
        match self {
            TopologyEvent::NodeRegistered { node } => node,
            TopologyEvent::NodeUnregistered { node } => node,
            TopologyEvent::NodeOnline { node } => node,
            TopologyEvent::NodeOffline { node } => node,
            TopologyEvent::PoolAdded { node, .. } => node,
            TopologyEvent::PoolChanged { node, .. } => node,
            TopologyEvent::PoolRemoved { node, .. } => node,
            TopologyEvent::ReplicaAdded { replica } => &replica.node,
            TopologyEvent::ReplicaChanged { replica } => &replica.node,
            TopologyEvent::ReplicaRemoved { replica } => &replica.node,
            TopologyEvent::NexusAdded { nexus } => &nexus.node,
            TopologyEvent::NexusChanged { nexus } => &nexus.node,
            TopologyEvent::NexusRemoved { nexus } => &nexus.node,
        }
    }

    /// Volume uuid for replica and nexus events
    pub fn volume_uuid(&self) -> Option<&str> {
        match self {
            TopologyEvent::ReplicaAdded { replica }
            | TopologyEvent::ReplicaChanged { replica }
            | TopologyEvent::ReplicaRemoved { replica } => Some(&replica.uuid),
            TopologyEvent::NexusAdded { nexus }
            | TopologyEvent::NexusChanged { nexus }
            | TopologyEvent::NexusRemoved { nexus } => Some(&nexus.uuid),
            _ => None,
        }
    }

    /// Check if this is a node-level event
    pub fn is_node_event(&self) -> bool {
        matches!(
            self,
            TopologyEvent::NodeRegistered { .. }
                | TopologyEvent::NodeUnregistered { .. }
                | TopologyEvent::NodeOnline { .. }
                | TopologyEvent::NodeOffline { .. }
        )
    }

    /// Check if this event is about a volume-owned object
    pub fn is_volume_object_event(&self) -> bool {
        self.volume_uuid().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::replica::ShareProtocol;

    #[test]
    fn test_node_event() {
        let event = TopologyEvent::NodeRegistered {
            node: "node-001".to_string(),
        };
        assert_eq!(event.node(), "node-001");
        assert!(event.is_node_event());
        assert!(!event.is_volume_object_event());
        assert_eq!(event.volume_uuid(), None);
    }

    #[test]
    fn test_replica_event() {
        let event = TopologyEvent::ReplicaAdded {
            replica: Replica {
                uuid: "vol-1".into(),
                node: "node-001".into(),
                pool: "pool-1".into(),
                size: 1024,
                thin: false,
                share: ShareProtocol::None,
                uri: "bdev:///vol-1".into(),
            },
        };
        assert_eq!(event.node(), "node-001");
        assert_eq!(event.volume_uuid(), Some("vol-1"));
        assert!(event.is_volume_object_event());
        assert!(!event.is_node_event());
    }
}
