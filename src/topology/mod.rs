//! Cluster Topology
//!
//! The observed shape of the storage cluster: nodes carrying pools and
//! nexuses, pools carrying replicas, all owned by the [`Registry`]. Other
//! layers reference objects by name key and resolve them through the
//! registry on demand.

pub mod events;
pub mod nexus;
pub mod node;
pub mod pool;
pub mod registry;
pub mod replica;

pub use events::TopologyEvent;
pub use nexus::{Child, ChildState, Nexus, NexusState};
pub use node::{Node, NodeSnapshot};
pub use pool::{Pool, PoolReport, PoolSnapshot, PoolState};
pub use registry::{PoolCandidate, Registry, RegistryStats};
pub use replica::{Replica, ShareProtocol};
