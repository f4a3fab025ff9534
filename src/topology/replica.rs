//! Replica value object
//!
//! One full copy of a volume's data, carved out of a pool and exposed by the
//! owning node's agent as a block device URI.

use serde::{Deserialize, Serialize};

// =============================================================================
// Share Protocol
// =============================================================================

/// Protocols a replica or nexus can be exposed over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareProtocol {
    /// Local access only
    #[default]
    None,
    /// NVMe over Fabrics
    Nvmf,
    /// iSCSI
    Iscsi,
}

impl std::fmt::Display for ShareProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShareProtocol::None => write!(f, "none"),
            ShareProtocol::Nvmf => write!(f, "nvmf"),
            ShareProtocol::Iscsi => write!(f, "iscsi"),
        }
    }
}

// =============================================================================
// Replica
// =============================================================================

/// One copy of a volume's data on a specific pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    /// Volume uuid this replica carries data for
    pub uuid: String,
    /// Node hosting the replica
    pub node: String,
    /// Pool the replica is carved from
    pub pool: String,
    /// Size in bytes
    pub size: u64,
    /// Thin provisioned
    pub thin: bool,
    /// How the replica is shared
    pub share: ShareProtocol,
    /// Access URI (`bdev:///` local, `nvmf://` shared)
    pub uri: String,
}

impl Replica {
    /// Check whether remote nodes can reach this replica
    pub fn is_shared(&self) -> bool {
        self.share != ShareProtocol::None
    }
}
