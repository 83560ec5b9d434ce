//! Error types for storage driver operations.

use thiserror::Error;

use crate::node::NodeId;

/// Errors that can occur during storage driver operations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DriverError {
    /// Referenced a node id that does not exist.
    #[error("Node not found: {id}")]
    NodeNotFound {
        /// The missing node id
        id: NodeId,
    },

    /// Inserted a node whose id already exists without `allow_overwrite`.
    #[error("Node already exists: {id}")]
    NodeExists {
        /// The colliding node id
        id: NodeId,
    },

    /// A node's parent link references a missing node.
    #[error("Parent not found: {id}")]
    ParentNotFound {
        /// The missing parent id
        id: NodeId,
    },

    /// Attached a child to a node kind that cannot hold children.
    #[error("Node {id} is not a container")]
    NotAContainer {
        /// The offending node id
        id: NodeId,
    },

    /// An object-only operation targeted a non-OBJECT node.
    #[error("Node {id} is not an object")]
    NotAnObject {
        /// The offending node id
        id: NodeId,
    },

    /// Inserted or moved a sibling onto an occupied `(parent, key)` slot.
    #[error("Position {key} under {parent} is occupied")]
    KeyOccupied {
        /// The parent node id
        parent: NodeId,
        /// The occupied parent key
        key: String,
    },

    /// A static data key collides with an existing CRDT child.
    #[error("Key {key} on {id} collides with a child node")]
    ChildKeyCollision {
        /// The object node id
        id: NodeId,
        /// The colliding key
        key: String,
    },

    /// Persisted rows do not describe a well-formed tree.
    #[error("Corrupt node storage: {reason}")]
    Corrupt {
        /// What was malformed
        reason: String,
    },

    /// Failed to serialize a value for storage.
    #[error("Failed to serialize value for storage")]
    SerializationFailed {
        #[source]
        source: serde_json::Error,
    },

    /// Failed to deserialize a stored value.
    #[error("Failed to deserialize stored value")]
    DeserializationFailed {
        #[source]
        source: serde_json::Error,
    },

    /// A database operation failed.
    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {reason}")]
    SqlxError {
        /// Description of the failure, including context
        reason: String,
        /// The underlying sqlx error, if available
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl DriverError {
    /// Check if this error is a missing-node/parent lookup failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DriverError::NodeNotFound { .. } | DriverError::ParentNotFound { .. }
        )
    }

    /// Check if this error is a tree-invariant conflict (id or slot taken,
    /// static key colliding with a child).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            DriverError::NodeExists { .. }
                | DriverError::KeyOccupied { .. }
                | DriverError::ChildKeyCollision { .. }
        )
    }

    /// Check if this error indicates damaged or undecodable storage.
    pub fn is_integrity_error(&self) -> bool {
        match self {
            DriverError::Corrupt { .. } | DriverError::DeserializationFailed { .. } => true,
            #[cfg(any(feature = "sqlite", feature = "postgres"))]
            DriverError::SqlxError { .. } => true,
            _ => false,
        }
    }
}

impl From<DriverError> for crate::Error {
    fn from(err: DriverError) -> Self {
        crate::Error::Driver(err)
    }
}
