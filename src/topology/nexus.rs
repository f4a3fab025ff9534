//! Nexus value object
//!
//! The per-volume replication hub. A nexus mirrors writes across its child
//! block devices (the volume's replicas) and exposes one logical device to
//! the consumer when published.

use super::replica::ShareProtocol;
use serde::{Deserialize, Serialize};

// =============================================================================
// States
// =============================================================================

/// Health of a nexus as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NexusState {
    Online,
    Degraded,
    Faulted,
    Offline,
}

impl NexusState {
    /// Whether the mirror can accept membership changes
    pub fn is_mutable(&self) -> bool {
        matches!(self, NexusState::Online | NexusState::Degraded)
    }
}

impl std::fmt::Display for NexusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NexusState::Online => write!(f, "online"),
            NexusState::Degraded => write!(f, "degraded"),
            NexusState::Faulted => write!(f, "faulted"),
            NexusState::Offline => write!(f, "offline"),
        }
    }
}

/// Health of a single nexus child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildState {
    /// In sync and serving I/O
    Online,
    /// Attached but still rebuilding from the other children
    Degraded,
    /// Dropped from the mirror
    Faulted,
}

// =============================================================================
// Child
// =============================================================================

/// One leg of the nexus mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    /// URI of the backing replica
    pub uri: String,
    pub state: ChildState,
}

impl Child {
    pub fn is_online(&self) -> bool {
        self.state == ChildState::Online
    }

    pub fn is_rebuilding(&self) -> bool {
        self.state == ChildState::Degraded
    }
}

// =============================================================================
// Nexus
// =============================================================================

/// Replication hub for one volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nexus {
    /// Volume uuid
    pub uuid: String,
    /// Node the nexus runs on
    pub node: String,
    /// Size in bytes
    pub size: u64,
    pub state: NexusState,
    pub children: Vec<Child>,
    /// Block device path handed to the consumer, set while published
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_path: Option<String>,
    /// How the published device is exposed
    pub share: ShareProtocol,
}

impl Nexus {
    /// Count children currently serving I/O
    pub fn online_children(&self) -> usize {
        self.children.iter().filter(|c| c.is_online()).count()
    }

    /// Count children still rebuilding
    pub fn rebuilding_children(&self) -> usize {
        self.children.iter().filter(|c| c.is_rebuilding()).count()
    }

    pub fn find_child(&self, uri: &str) -> Option<&Child> {
        self.children.iter().find(|c| c.uri == uri)
    }

    pub fn is_published(&self) -> bool {
        self.device_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_nexus(children: Vec<(&str, ChildState)>) -> Nexus {
        Nexus {
            uuid: "vol-1".into(),
            node: "node-1".into(),
            size: 1024,
            state: NexusState::Online,
            children: children
                .into_iter()
                .map(|(uri, state)| Child {
                    uri: uri.into(),
                    state,
                })
                .collect(),
            device_path: None,
            share: ShareProtocol::None,
        }
    }

    #[test]
    fn test_child_counting() {
        let nexus = make_nexus(vec![
            ("bdev:///vol-1", ChildState::Online),
            ("nvmf://node-2/vol-1", ChildState::Degraded),
            ("nvmf://node-3/vol-1", ChildState::Faulted),
        ]);

        assert_eq!(nexus.online_children(), 1);
        assert_eq!(nexus.rebuilding_children(), 1);
        assert!(nexus.find_child("bdev:///vol-1").is_some());
        assert!(nexus.find_child("bdev:///other").is_none());
    }

    #[test]
    fn test_published_flag() {
        let mut nexus = make_nexus(vec![("bdev:///vol-1", ChildState::Online)]);
        assert!(!nexus.is_published());

        nexus.device_path = Some("/dev/nbd0".into());
        assert!(nexus.is_published());
    }

    #[test]
    fn test_state_mutability() {
        assert!(NexusState::Online.is_mutable());
        assert!(NexusState::Degraded.is_mutable());
        assert!(!NexusState::Faulted.is_mutable());
        assert!(!NexusState::Offline.is_mutable());
    }
}
