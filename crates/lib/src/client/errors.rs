//! Error types for the client-side mutation engine.

use thiserror::Error;

/// Errors that can occur in the mutation engine.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ClientError {
    /// Looked up a mutator name that was never registered.
    #[error("Unknown mutation: {name}")]
    UnknownMutation {
        /// The unregistered mutation name
        name: String,
    },

    /// Registered the same mutator name twice.
    #[error("Mutation already registered: {name}")]
    MutationAlreadyRegistered {
        /// The duplicate mutation name
        name: String,
    },

    /// The server broke the connection protocol; fatal to the connection.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// What the server did wrong
        reason: String,
    },

    /// Attempted a connection-scoped operation without a connection.
    #[error("Client is not connected")]
    NotConnected,
}

impl ClientError {
    /// Check if this error is fatal to the connection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, ClientError::ProtocolViolation { .. })
    }

    /// Check if this error concerns the mutator registry.
    pub fn is_registry_error(&self) -> bool {
        matches!(
            self,
            ClientError::UnknownMutation { .. } | ClientError::MutationAlreadyRegistered { .. }
        )
    }
}

impl From<ClientError> for crate::Error {
    fn from(err: ClientError) -> Self {
        crate::Error::Client(err)
    }
}
