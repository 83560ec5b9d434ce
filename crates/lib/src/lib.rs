//!
//! Livetree: a replicated CRDT document tree with optimistic client
//! mutations and versioned server storage.
//!
//! ## Core Concepts
//!
//! * **Storage nodes (`node::StorageNode`)**: The addressable units of a
//!   document, a flat arena of OBJECT/LIST/MAP/REGISTER nodes linked by
//!   parent references. A root OBJECT always exists.
//! * **Positions (`pos::Position`)**: Fractional, byte-ordered list keys;
//!   generating one never renumbers existing siblings.
//! * **Storage drivers (`driver::StorageDriver`)**: A pluggable server-side
//!   persistence layer. Every mutation is atomic, advances a committed
//!   clock by one, and is replayable as a delta. Bundled implementations:
//!   `InMemoryDriver` plus a SQL driver for SQLite and PostgreSQL.
//! * **Deltas (`delta::NodeDelta`)**: The net `(removed, values, refs)`
//!   transition between two clock points, the unit of client/server sync.
//! * **Snapshots (`driver::TreeSnapshot`)**: Isolated point-in-time reads
//!   of the committed tree, the input to JSON projection.
//! * **Layered cache (`cache::LayeredCache`)**: An ordered key/value map
//!   with nested transactions, backing the client's speculative state.
//! * **Client (`client::Client`)**: The optimistic mutation engine;
//!   registered mutators run locally at once and replay on top of every
//!   authoritative delta until acknowledged.
//! * **Projection (`serialize`)**: Tree-to-JSON rendering in two flavors
//!   (typed envelopes or lossy plain JSON), eager or streaming.

pub mod cache;
pub mod client;
pub mod constants;
pub mod delta;
pub mod driver;
pub mod node;
pub mod pos;
pub mod protocol;
pub mod serialize;
pub mod server;

pub use cache::LayeredCache;
pub use client::Client;
pub use delta::NodeDelta;
pub use driver::{InMemoryDriver, StorageDriver, TreeSnapshot};
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub use driver::SqlDriver;
pub use node::{CrdtNode, NodeId, NodeKind, ParentLink, StorageNode};
pub use pos::Position;

/// Y-CRDT types re-exported for convenience when the "y-crdt" feature is
/// enabled.
///
/// This module re-exports commonly used types from the `yrs` crate so that
/// client code doesn't need to add `yrs` as a separate dependency when
/// storing Yjs updates alongside the node tree.
#[cfg(feature = "y-crdt")]
pub mod y_crdt {
    pub use yrs::*;
}

/// Result type used throughout the livetree library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the livetree library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Structured cache errors from the cache module
    #[error(transparent)]
    Cache(cache::CacheError),

    /// Structured mutation-engine errors from the client module
    #[error(transparent)]
    Client(client::ClientError),

    /// Structured storage errors from the driver module
    #[error(transparent)]
    Driver(driver::DriverError),

    /// Structured projection errors from the serialize module
    #[error(transparent)]
    Serialize(serialize::SerializeError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Cache(_) => "cache",
            Error::Client(_) => "client",
            Error::Driver(_) => "driver",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Driver(driver_err) => driver_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error indicates a conflict (already exists or occupied).
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Driver(driver_err) => driver_err.is_conflict(),
            _ => false,
        }
    }

    /// Check if this error indicates a data integrity issue.
    pub fn is_integrity_error(&self) -> bool {
        match self {
            Error::Driver(driver_err) => driver_err.is_integrity_error(),
            Error::Serialize(ser_err) => ser_err.is_integrity_error(),
            _ => false,
        }
    }

    /// Check if this error is fatal to a client connection.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Error::Client(client_err) => client_err.is_protocol_violation(),
            _ => false,
        }
    }

    /// Check if this error is storage/driver-related.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Error::Driver(_))
    }
}
