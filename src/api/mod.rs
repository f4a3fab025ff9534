//! API Module
//!
//! Provides the REST API for volume lifecycle, topology queries, and
//! capacity reporting.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
