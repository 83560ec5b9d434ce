//! Storage drivers for the server-side node tree.
//!
//! This module defines the [`StorageDriver`] trait, the minimal set of CRDT
//! tree operations a persistence backend must support, plus the bundled
//! implementations: [`InMemoryDriver`] for tests and embedded use, and the
//! versioned SQL reference driver behind the `sqlite`/`postgres` features.
//!
//! The trait is decoupled from any storage technology. Much of the
//! correctness burden (atomic validate-then-apply, version logging, snapshot
//! isolation) lives in the implementations, since the optimal approach
//! depends on the underlying store.

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::Result;
use crate::delta::NodeDelta;
use crate::node::{JsonObject, NodeId, StorageNode};
use crate::pos::Position;

pub mod errors;
pub mod in_memory;
pub mod snapshot;
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod sql;

pub use errors::DriverError;
pub use in_memory::InMemoryDriver;
pub use snapshot::{TreeSnapshot, with_snapshot};
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub use sql::SqlDriver;

/// A leased session record: an opaque JSON payload plus its lease expiry.
///
/// Expiry is stored, never enforced; callers decide what an expired lease
/// means.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedSession {
    pub value: Value,
    pub expires_at: DateTime<Utc>,
}

/// The CRDT tree operations a persistence backend must support.
///
/// All implementations must be `Send + Sync` for sharing across tasks, and
/// `Any` to allow downcasting to a concrete driver where needed.
///
/// # Transactionality
///
/// Every mutating node operation is atomic: it either fully applies (and
/// advances the committed clock by one) or leaves no observable state
/// change. A snapshot taken concurrently with a mutation never observes
/// partial writes.
///
/// # The root node
///
/// The tree always contains a root node (an OBJECT with no parent), even
/// when logically empty. Deleting or moving the root is a no-op.
#[async_trait]
pub trait StorageDriver: Send + Sync + Any {
    /// Retrieves a node by id, or [`DriverError::NodeNotFound`].
    async fn get_node(&self, id: &NodeId) -> Result<StorageNode>;

    async fn has_node(&self, id: &NodeId) -> Result<bool>;

    /// All node ids currently in the tree. Always includes the root.
    async fn list_nodes(&self) -> Result<Vec<NodeId>>;

    /// Resolves the CRDT child at `(parent, key)`. Static OBJECT data fields
    /// are not children and never resolve here.
    async fn get_child_at(&self, parent: &NodeId, key: &str) -> Result<Option<NodeId>>;

    async fn has_child_at(&self, parent: &NodeId, key: &str) -> Result<bool> {
        Ok(self.get_child_at(parent, key).await?.is_some())
    }

    /// The position immediately right of `pos` among the children of
    /// `parent`, under the positions' total order. `pos` itself need not
    /// exist.
    async fn get_next_sibling(&self, parent: &NodeId, pos: &Position) -> Result<Option<Position>>;

    /// Inserts a node under its parent link.
    ///
    /// Errors with [`DriverError::NodeExists`] on id collision and
    /// [`DriverError::KeyOccupied`] when another sibling holds the same
    /// `(parent, key)` slot, unless `allow_overwrite`, in which case the
    /// existing node (and its subtree) is deleted first.
    async fn set_child(&self, node: StorageNode, allow_overwrite: bool) -> Result<()>;

    /// Repositions a node under its current parent. Errors with
    /// [`DriverError::KeyOccupied`] if `new_pos` is taken. No-op on root.
    async fn move_sibling(&self, id: &NodeId, new_pos: Position) -> Result<()>;

    /// Recursively deletes a node and its subtree. No-op on root.
    async fn delete_node(&self, id: &NodeId) -> Result<()>;

    /// Removes a static data field if `id` is an OBJECT with that field;
    /// otherwise deletes the CRDT child (and subtree) at `(id, key)`; no-op
    /// when neither applies.
    async fn delete_child_key(&self, id: &NodeId, key: &str) -> Result<()>;

    /// Merges static fields into an OBJECT node.
    ///
    /// A key colliding with an existing CRDT child errors with
    /// [`DriverError::ChildKeyCollision`] unless `allow_overwrite`, which
    /// deletes the colliding child subtrees first.
    async fn set_object_data(
        &self,
        id: &NodeId,
        data: JsonObject,
        allow_overwrite: bool,
    ) -> Result<()>;

    /// Materializes an isolated read-only view of the committed tree.
    ///
    /// `low_memory` skips the per-parent child index, trading traversal
    /// speed for footprint. The caller must destroy the snapshot; see
    /// [`with_snapshot`].
    async fn get_snapshot(&self, low_memory: bool) -> Result<TreeSnapshot>;

    /// The committed clock. Advances by one per committed mutation.
    async fn clock(&self) -> Result<u64>;

    /// The net state transition since the given clock: per `(node, key)`,
    /// the latest write after `since`, split into removals, values, and
    /// child refs.
    async fn delta_since(&self, since: u64) -> Result<NodeDelta>;

    /// Exports the entire current tree as a delta (the degenerate
    /// everything-since-zero case, used for initial sync).
    async fn full_delta(&self) -> Result<NodeDelta>;

    // === Metadata key/value store ===

    async fn get_meta(&self, key: &str) -> Result<Option<Value>>;

    async fn put_meta(&self, key: &str, value: Value) -> Result<()>;

    async fn delete_meta(&self, key: &str) -> Result<()>;

    /// Allocates the next actor id. Must never return duplicates, including
    /// under concurrent callers.
    async fn next_actor(&self) -> Result<u64>;

    // === Yjs binary update storage ===

    /// Appends one encoded Yjs update for the given document id.
    async fn append_ydoc_update(&self, doc_id: &str, update: &[u8]) -> Result<()>;

    /// All stored updates for a document, in append order.
    async fn get_ydoc_updates(&self, doc_id: &str) -> Result<Vec<Vec<u8>>>;

    // === Leased sessions ===

    async fn put_session(
        &self,
        key: &str,
        value: Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_session(&self, key: &str) -> Result<Option<LeasedSession>>;

    async fn delete_session(&self, key: &str) -> Result<()>;

    /// Replaces the entire node tree with the given nodes (a root is
    /// synthesized if absent) and clears the version log.
    ///
    /// Previously taken snapshots stay valid but stale; any other cached
    /// view of the tree must be re-read. Clients can only recover via a
    /// full-state delta.
    async fn reset_nodes(&self, nodes: Vec<StorageNode>) -> Result<()>;

    /// Returns self as [`Any`] for downcasting to a concrete driver.
    fn as_any(&self) -> &dyn Any;
}

/// Merges every stored update for a document into one Yjs state update.
///
/// Returns `None` when no updates are stored for the document.
#[cfg(feature = "y-crdt")]
pub async fn merged_ydoc(driver: &dyn StorageDriver, doc_id: &str) -> Result<Option<Vec<u8>>> {
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

    let updates = driver.get_ydoc_updates(doc_id).await?;
    if updates.is_empty() {
        return Ok(None);
    }

    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        for bytes in &updates {
            let update = Update::decode_v1(bytes).map_err(|err| DriverError::Corrupt {
                reason: format!("undecodable yjs update for {doc_id}: {err}"),
            })?;
            txn.apply_update(update).map_err(|err| DriverError::Corrupt {
                reason: format!("unappliable yjs update for {doc_id}: {err}"),
            })?;
        }
    }
    let txn = doc.transact();
    Ok(Some(txn.encode_state_as_update_v1(&StateVector::default())))
}
