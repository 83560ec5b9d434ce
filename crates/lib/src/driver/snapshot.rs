//! Read-only tree snapshots.
//!
//! A [`TreeSnapshot`] is an isolated, immutable view of the node tree at a
//! single clock point, materialized by a driver inside one read transaction
//! so it never observes partial writes. Snapshots stay valid (but stale)
//! across later mutations, including a full tree reset.
//!
//! Callers must release a snapshot with [`TreeSnapshot::destroy`] once
//! traversal completes or aborts; [`with_snapshot`] scopes acquisition so
//! release is guaranteed.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;
use uuid::Uuid;

use crate::Result;
use crate::driver::StorageDriver;
use crate::driver::errors::DriverError;
use crate::node::{NodeId, StorageNode};

/// An immutable view of the whole node tree at one clock point.
pub struct TreeSnapshot {
    id: Uuid,
    clock: u64,
    nodes: HashMap<NodeId, StorageNode>,
    /// Per-parent child index ordered by parent key. Skipped in low-memory
    /// mode, where child iteration scans the arena instead.
    children: Option<HashMap<NodeId, BTreeMap<String, NodeId>>>,
}

impl TreeSnapshot {
    /// Builds a snapshot from a flat set of nodes. A root node is always
    /// present in the result, even for a logically empty tree.
    pub(crate) fn from_nodes(
        clock: u64,
        nodes: impl IntoIterator<Item = StorageNode>,
        low_memory: bool,
    ) -> Self {
        let mut arena: HashMap<NodeId, StorageNode> = nodes
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect();
        arena
            .entry(NodeId::root())
            .or_insert_with(StorageNode::root);

        let children = if low_memory {
            None
        } else {
            let mut index: HashMap<NodeId, BTreeMap<String, NodeId>> = HashMap::new();
            for node in arena.values() {
                if let Some(link) = node.parent() {
                    index
                        .entry(link.node_id.clone())
                        .or_default()
                        .insert(link.key.clone(), node.id.clone());
                }
            }
            Some(index)
        };

        TreeSnapshot {
            id: Uuid::new_v4(),
            clock,
            nodes: arena,
            children,
        }
    }

    /// Unique identity of this snapshot instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The committed clock this snapshot was taken at.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Number of nodes in the snapshot (root included).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The root node. Always present in a well-formed snapshot.
    pub fn get_root(&self) -> Result<&StorageNode> {
        self.nodes.get(&NodeId::root()).ok_or_else(|| {
            DriverError::Corrupt {
                reason: "snapshot has no root node".to_string(),
            }
            .into()
        })
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&StorageNode> {
        self.nodes.get(id)
    }

    /// The CRDT children of `id` as `(parent_key, child_id)` pairs in
    /// parent-key order. Static OBJECT fields are not children.
    pub fn iter_children(&self, id: &NodeId) -> Vec<(String, NodeId)> {
        match &self.children {
            Some(index) => index
                .get(id)
                .map(|slots| {
                    slots
                        .iter()
                        .map(|(key, child)| (key.clone(), child.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            None => {
                let mut slots: BTreeMap<String, NodeId> = BTreeMap::new();
                for node in self.nodes.values() {
                    if let Some(link) = node.parent()
                        && &link.node_id == id
                    {
                        slots.insert(link.key.clone(), node.id.clone());
                    }
                }
                slots.into_iter().collect()
            }
        }
    }

    /// Unordered flat iteration over every node in the snapshot.
    pub fn iter_all(&self) -> impl Iterator<Item = &StorageNode> {
        self.nodes.values()
    }

    /// Releases the snapshot. Must be called once traversal completes or is
    /// aborted; prefer [`with_snapshot`] which guarantees it.
    pub fn destroy(self) {
        debug!(snapshot = %self.id, clock = self.clock, "snapshot destroyed");
    }
}

/// Takes a snapshot, runs `f` over it, and releases it regardless of the
/// outcome.
pub async fn with_snapshot<T>(
    driver: &dyn StorageDriver,
    low_memory: bool,
    f: impl FnOnce(&TreeSnapshot) -> Result<T>,
) -> Result<T> {
    let snapshot = driver.get_snapshot(low_memory).await?;
    let result = f(&snapshot);
    snapshot.destroy();
    result
}
