//! Error types for tree-to-JSON projection.

use thiserror::Error;

use crate::node::NodeId;

/// Errors that can occur while projecting a snapshot to JSON.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SerializeError {
    /// A child slot references a node the snapshot does not contain.
    #[error("Child slot references missing node {id}")]
    DanglingChild {
        /// The missing node id
        id: NodeId,
    },

    /// A JSON value could not be written out.
    #[error("Failed to serialize JSON value")]
    Serialization {
        #[source]
        source: serde_json::Error,
    },
}

impl SerializeError {
    /// Check if this error indicates an inconsistent snapshot.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, SerializeError::DanglingChild { .. })
    }
}

impl From<SerializeError> for crate::Error {
    fn from(err: SerializeError) -> Self {
        crate::Error::Serialize(err)
    }
}
