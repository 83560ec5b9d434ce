//! Error types for the layered transactional cache.

use thiserror::Error;

/// Errors that can occur during layered cache operations.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CacheError {
    /// `commit` or `rollback` was called with no open transaction.
    #[error("No transaction to {action}")]
    NoTransaction {
        /// The attempted action ("commit" or "roll back").
        action: &'static str,
    },
}

impl CacheError {
    /// Check if this error indicates a transaction-state misuse.
    pub fn is_transaction_error(&self) -> bool {
        matches!(self, CacheError::NoTransaction { .. })
    }
}

impl From<CacheError> for crate::Error {
    fn from(err: CacheError) -> Self {
        crate::Error::Cache(err)
    }
}
