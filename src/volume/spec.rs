//! Volume Specification
//!
//! The desired state a caller hands to the manager. Everything else the
//! engine does is an attempt to make the observed cluster match one of
//! these.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Desired state of a volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Number of data copies to maintain
    pub replica_count: u32,
    /// Nodes to place replicas on first, in order of preference
    #[serde(default)]
    pub preferred_nodes: Vec<String>,
    /// When non-empty, replicas may only land on these nodes
    #[serde(default)]
    pub required_nodes: Vec<String>,
    /// Minimum usable capacity in bytes
    pub required_bytes: u64,
    /// Capacity ceiling in bytes, zero for none
    #[serde(default)]
    pub limit_bytes: u64,
}

impl VolumeSpec {
    /// Reject specs no placement could ever satisfy
    pub fn validate(&self) -> Result<()> {
        if self.replica_count == 0 {
            return Err(Error::InvalidRequest(
                "replica count must be at least 1".into(),
            ));
        }
        if self.required_bytes == 0 {
            return Err(Error::InvalidRequest(
                "required bytes must be greater than zero".into(),
            ));
        }
        if self.limit_bytes != 0 && self.required_bytes > self.limit_bytes {
            return Err(Error::InvalidRequest(format!(
                "required bytes {} exceeds limit {}",
                self.required_bytes, self.limit_bytes
            )));
        }
        Ok(())
    }

    /// Size replicas are provisioned at: the limit when one is set,
    /// otherwise exactly what was required
    pub fn target_size(&self) -> u64 {
        if self.limit_bytes == 0 {
            self.required_bytes
        } else {
            self.limit_bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(required: u64, limit: u64) -> VolumeSpec {
        VolumeSpec {
            replica_count: 2,
            required_bytes: required,
            limit_bytes: limit,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_size_uses_limit_when_set() {
        assert_eq!(spec(10, 50).target_size(), 50);
        assert_eq!(spec(10, 0).target_size(), 10);
        assert_eq!(spec(50, 50).target_size(), 50);
    }

    #[test]
    fn test_validation() {
        assert!(spec(10, 0).validate().is_ok());
        assert!(spec(10, 50).validate().is_ok());

        // Nothing to place.
        assert!(spec(0, 0).validate().is_err());
        assert!(VolumeSpec {
            replica_count: 0,
            required_bytes: 10,
            ..Default::default()
        }
        .validate()
        .is_err());

        // Contradictory bounds.
        assert!(spec(50, 10).validate().is_err());
    }
}
