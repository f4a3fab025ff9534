//! Blockplane - Volume Reconciliation Control Plane
//!
//! A control plane for distributed block storage that keeps volumes at
//! their desired replica count by driving per-node storage agents. Each
//! volume is a nexus on one node fanning out to replicas across the
//! cluster; the engine reconciles the observed topology against the
//! declared spec.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       REST API (axum)                        │
//! │         volumes · publish · nodes · pools · capacity         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                        Volume Manager                        │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────┐  │
//! │  │     Volume     │  │     Volume     │  │     Volume     │  │
//! │  │ reconciliation │  │ reconciliation │  │ reconciliation │  │
//! │  └────────┬───────┘  └────────┬───────┘  └────────┬───────┘  │
//! │           └───────────────────┼───────────────────┘          │
//! │                    ┌──────────┴──────────┐                   │
//! │                    │      Registry       │                   │
//! │                    │ nodes/pools/replicas│                   │
//! │                    └──────────┬──────────┘                   │
//! ├───────────────────────────────┼──────────────────────────────┤
//! │                        Agent Clients                         │
//! │         replica / nexus operations on storage nodes          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`topology`]: Cluster topology registry and replica placement
//! - [`volume`]: Volume specs, the reconciliation engine, and lifecycle events
//! - [`agent`]: Storage node agent client and in-process simulator
//! - [`api`]: REST API server and handlers
//! - [`error`]: Error types and handling

pub mod agent;
pub mod api;
pub mod error;
pub mod topology;
pub mod volume;

// Re-export commonly used types
pub use agent::{AgentClient, AgentClientRef, OpLog, SimAgent};

pub use api::{run_rest_server, RestRouter};

pub use error::{Error, ErrorKind, Result};

pub use topology::{
    Child, ChildState, Nexus, NexusState,
    Node, NodeSnapshot, Pool, PoolCandidate, PoolReport, PoolSnapshot, PoolState,
    Registry, RegistryStats, Replica, ShareProtocol, TopologyEvent,
};

pub use volume::{
    EventBus, EventKind, EventObject, VolumeEvent,
    ManagerConfig, ManagerStatus, VolumeManager,
    Volume, VolumeSnapshot, VolumeSpec, VolumeState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
