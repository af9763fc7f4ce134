//! Node status messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A node's announcement of the rate it is currently enforcing.
///
/// Receivers keep only the latest status per `node_id`; statuses from
/// different nodes are never ordered against each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// The announcing node.
    pub node_id: String,
    /// The node's local share, in requests per second.
    pub rate: u64,
    /// When the node produced this status.
    pub timestamp: DateTime<Utc>,
}

impl NodeStatus {
    /// Create a status stamped with the current wall-clock time.
    pub fn new(node_id: impl Into<String>, rate: u64) -> Self {
        Self::at(node_id, rate, Utc::now())
    }

    /// Create a status with an explicit timestamp.
    pub fn at(node_id: impl Into<String>, rate: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            rate,
            timestamp,
        }
    }

    /// Encode as JSON for an external transport.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a status received from an external transport.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
