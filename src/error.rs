//! Error types for the blockplane control plane
//!
//! Provides structured error types for all engine components including
//! topology lookups, replica placement, volume operations, and the REST API.

use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid volume request: {0}")]
    InvalidRequest(String),

    #[error("Volume {uuid} cannot shrink from {current} to {requested} bytes")]
    VolumeShrink {
        uuid: String,
        current: u64,
        requested: u64,
    },

    #[error("Volume {uuid} cannot extend from {current} to {requested} bytes")]
    VolumeExtend {
        uuid: String,
        current: u64,
        requested: u64,
    },

    #[error("Volume {uuid} is already published at {device}")]
    AlreadyPublished { uuid: String, device: String },

    // =========================================================================
    // Placement Errors
    // =========================================================================
    #[error(
        "Insufficient storage for volume {uuid}: {requested} bytes on {replicas} distinct nodes"
    )]
    InsufficientStorage {
        uuid: String,
        requested: u64,
        replicas: u32,
    },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Volume {uuid} has no nexus")]
    NexusMissing { uuid: String },

    #[error("Node not found: {node}")]
    NodeNotFound { node: String },

    #[error("Node already registered: {node}")]
    NodeAlreadyRegistered { node: String },

    // =========================================================================
    // Remote Call Errors
    // =========================================================================
    #[error("Node unreachable: {node}")]
    NodeOffline { node: String },

    #[error("Remote call failed on node {node}: {operation}: {reason}")]
    RemoteCall {
        node: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, mirroring the failure taxonomy
/// surfaced to API consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request rejected before any remote call
    InvalidArgument,
    /// Placement could not satisfy the request
    ResourceExhausted,
    /// The addressed object does not exist
    NotFound,
    /// An agent call was attempted and failed, or the node was unreachable
    RemoteCall,
    /// Everything else
    Internal,
}

impl Error {
    /// Classify this error for API consumers
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_)
            | Error::VolumeShrink { .. }
            | Error::VolumeExtend { .. }
            | Error::AlreadyPublished { .. }
            | Error::NodeAlreadyRegistered { .. }
            | Error::CapacityParse(_) => ErrorKind::InvalidArgument,

            Error::InsufficientStorage { .. } => ErrorKind::ResourceExhausted,

            Error::NotFound { .. } | Error::NexusMissing { .. } | Error::NodeNotFound { .. } => {
                ErrorKind::NotFound
            }

            Error::NodeOffline { .. } | Error::RemoteCall { .. } => ErrorKind::RemoteCall,

            _ => ErrorKind::Internal,
        }
    }

    /// Check if this error came from (or stands in for) a failed agent call
    pub fn is_remote(&self) -> bool {
        matches!(self.kind(), ErrorKind::RemoteCall)
    }

    /// Check if this error was raised before any remote mutation
    pub fn is_precondition(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument | ErrorKind::ResourceExhausted | ErrorKind::NotFound
        )
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::InvalidRequest("requiredBytes must be non-zero".into());
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = Error::InsufficientStorage {
            uuid: "vol-1".into(),
            requested: 1000,
            replicas: 3,
        };
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

        let err = Error::NexusMissing { uuid: "vol-1".into() };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::RemoteCall {
            node: "node-1".into(),
            operation: "create_replica".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RemoteCall);
    }

    #[test]
    fn test_error_predicates() {
        let remote = Error::NodeOffline { node: "node-2".into() };
        assert!(remote.is_remote());
        assert!(!remote.is_precondition());

        let shrink = Error::VolumeShrink {
            uuid: "vol-1".into(),
            current: 50,
            requested: 10,
        };
        assert!(!shrink.is_remote());
        assert!(shrink.is_precondition());

        let internal = Error::Internal("broken".into());
        assert!(!internal.is_remote());
        assert!(!internal.is_precondition());
    }
}
