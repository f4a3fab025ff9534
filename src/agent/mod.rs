//! Storage Node Agents
//!
//! The RPC boundary between the control plane and the io-engines running on
//! storage nodes. [`AgentClient`] is the port; [`SimAgent`] is the in-memory
//! adapter used by the simulated cluster and the test suites.

pub mod client;
pub mod sim;

pub use client::{AgentClient, AgentClientRef};
pub use sim::{OpLog, OpRecord, SimAgent};
