//! Agent Client Port - RPC surface of a storage node's io-engine agent
//!
//! Each registered node carries one handle implementing this trait. The
//! engine calls it to realize desired state; adapters translate to the
//! node's actual transport.
//!
//! All mutating calls are idempotent on the agent side: creating an object
//! that already exists returns it, destroying one that is gone succeeds.

use crate::error::Result;
use crate::topology::{Child, Nexus, Replica, ShareProtocol};
use async_trait::async_trait;
use std::sync::Arc;

/// Port for per-node storage agent operations
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Create a replica on the given pool
    async fn create_replica(
        &self,
        uuid: &str,
        pool: &str,
        size: u64,
        thin: bool,
        share: ShareProtocol,
    ) -> Result<Replica>;

    /// Destroy a replica; succeeds when it no longer exists
    async fn destroy_replica(&self, uuid: &str) -> Result<()>;

    /// List all replicas hosted on the node
    async fn list_replicas(&self) -> Result<Vec<Replica>>;

    /// Change a replica's share protocol, returning its new access URI
    async fn share_replica(&self, uuid: &str, share: ShareProtocol) -> Result<String>;

    /// Create a nexus mirroring over the given child URIs
    async fn create_nexus(&self, uuid: &str, size: u64, children: &[String]) -> Result<Nexus>;

    /// Destroy a nexus; succeeds when it no longer exists
    async fn destroy_nexus(&self, uuid: &str) -> Result<()>;

    /// List all nexuses hosted on the node
    async fn list_nexus(&self) -> Result<Vec<Nexus>>;

    /// Attach a child to an existing nexus, starting a rebuild onto it
    async fn add_child_nexus(&self, uuid: &str, uri: &str) -> Result<Child>;

    /// Detach a child from a nexus; succeeds when the child is absent
    async fn remove_child_nexus(&self, uuid: &str, uri: &str) -> Result<()>;

    /// Expose a nexus to the host, returning the block device path
    async fn publish_nexus(&self, uuid: &str, key: &str) -> Result<String>;

    /// Withdraw a nexus from the host; succeeds when not published
    async fn unpublish_nexus(&self, uuid: &str) -> Result<()>;
}

impl std::fmt::Debug for dyn AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AgentClient")
    }
}

pub type AgentClientRef = Arc<dyn AgentClient>;
