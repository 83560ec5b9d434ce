//! In-memory storage driver.
//!
//! Keeps the node arena, a per-parent child index, and a version log behind
//! one mutex, so every mutation is naturally atomic: operations validate
//! first and only then apply, and the whole batch is visible (or not) as a
//! unit. The version log is an append-only vector mirroring the SQL
//! driver's `node_versions` table, so `delta_since` behaves identically
//! across drivers.
//!
//! Intended for tests and embedded single-process use.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::constants::PARENT_KEY;
use crate::delta::NodeDelta;
use crate::driver::errors::DriverError;
use crate::driver::snapshot::TreeSnapshot;
use crate::driver::{LeasedSession, StorageDriver};
use crate::node::{
    CrdtNode, JsonObject, NodeId, NodeKind, ParentLink, StorageNode, parent_to_value,
};
use crate::pos::Position;

/// One entry of the in-memory version log. `jval` and `ref_id` both `None`
/// marks a removal.
#[derive(Debug, Clone)]
struct VersionRow {
    nid: NodeId,
    key: String,
    clock: u64,
    jval: Option<Value>,
    ref_id: Option<NodeId>,
}

struct Inner {
    nodes: HashMap<NodeId, StorageNode>,
    /// Child slots per parent, ordered by parent key.
    children: HashMap<NodeId, BTreeMap<String, NodeId>>,
    versions: Vec<VersionRow>,
    clock: u64,
    meta: HashMap<String, Value>,
    next_actor: u64,
    ydocs: HashMap<String, Vec<Vec<u8>>>,
    sessions: HashMap<String, LeasedSession>,
}

impl Inner {
    fn new() -> Self {
        let root = StorageNode::root();
        let mut nodes = HashMap::new();
        nodes.insert(root.id.clone(), root);
        Inner {
            nodes,
            children: HashMap::new(),
            versions: Vec::new(),
            clock: 0,
            meta: HashMap::new(),
            next_actor: 0,
            ydocs: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    fn node(&self, id: &NodeId) -> Result<&StorageNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| DriverError::NodeNotFound { id: id.clone() }.into())
    }

    fn slot(&self, parent: &NodeId, key: &str) -> Option<&NodeId> {
        self.children.get(parent).and_then(|slots| slots.get(key))
    }

    fn log_value(&mut self, clock: u64, nid: NodeId, key: String, value: Value) {
        self.versions.push(VersionRow {
            nid,
            key,
            clock,
            jval: Some(value),
            ref_id: None,
        });
    }

    fn log_ref(&mut self, clock: u64, nid: NodeId, key: String, child: NodeId) {
        self.versions.push(VersionRow {
            nid,
            key,
            clock,
            jval: None,
            ref_id: Some(child),
        });
    }

    fn log_removal(&mut self, clock: u64, nid: NodeId, key: String) {
        self.versions.push(VersionRow {
            nid,
            key,
            clock,
            jval: None,
            ref_id: None,
        });
    }

    /// Drops the `(parent, key)` slot pointing at `node` and logs the
    /// removal. Used for the top of a deleted subtree only; interior slot
    /// rows are logged by [`remove_subtree`](Inner::remove_subtree).
    fn unlink_from_parent(&mut self, node: &StorageNode, clock: u64) {
        if let Some(link) = node.parent().cloned() {
            if let Some(slots) = self.children.get_mut(&link.node_id) {
                slots.remove(&link.key);
            }
            self.log_removal(clock, link.node_id, link.key);
        }
    }

    /// Removes `id` and everything below it from the arena, logging removal
    /// rows for every value row and child slot that disappears.
    fn remove_subtree(&mut self, id: &NodeId, clock: u64) {
        let mut stack = vec![id.clone()];
        while let Some(nid) = stack.pop() {
            if let Some(slots) = self.children.remove(&nid) {
                for (key, child) in slots {
                    self.log_removal(clock, nid.clone(), key);
                    stack.push(child);
                }
            }
            if let Some(node) = self.nodes.remove(&nid) {
                for (key, _) in node.value_rows() {
                    self.log_removal(clock, nid.clone(), key);
                }
            }
        }
    }

    /// Inserts a node's own value rows and arena entry, plus the slot on its
    /// parent, all at the given clock.
    fn insert_node(&mut self, node: StorageNode, clock: u64) {
        for (key, value) in node.value_rows() {
            self.log_value(clock, node.id.clone(), key, value);
        }
        if let Some(link) = node.parent().cloned() {
            self.children
                .entry(link.node_id.clone())
                .or_default()
                .insert(link.key.clone(), node.id.clone());
            self.log_ref(clock, link.node_id, link.key, node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }
}

/// A thread-safe, non-persistent storage driver.
pub struct InMemoryDriver {
    inner: Mutex<Inner>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        InMemoryDriver {
            inner: Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn get_node(&self, id: &NodeId) -> Result<StorageNode> {
        let inner = self.lock();
        inner.node(id).cloned()
    }

    async fn has_node(&self, id: &NodeId) -> Result<bool> {
        Ok(self.lock().nodes.contains_key(id))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeId>> {
        Ok(self.lock().nodes.keys().cloned().collect())
    }

    async fn get_child_at(&self, parent: &NodeId, key: &str) -> Result<Option<NodeId>> {
        Ok(self.lock().slot(parent, key).cloned())
    }

    async fn get_next_sibling(&self, parent: &NodeId, pos: &Position) -> Result<Option<Position>> {
        let inner = self.lock();
        let Some(slots) = inner.children.get(parent) else {
            return Ok(None);
        };
        let next = slots
            .range::<str, _>((Bound::Excluded(pos.as_str()), Bound::Unbounded))
            .next()
            .map(|(key, _)| Position::from(key.as_str()));
        Ok(next)
    }

    async fn set_child(&self, node: StorageNode, allow_overwrite: bool) -> Result<()> {
        let Some(link) = node.parent().cloned() else {
            return Err(DriverError::Corrupt {
                reason: format!("set_child of {} without a parent link", node.id),
            }
            .into());
        };

        let mut inner = self.lock();
        let parent = inner
            .nodes
            .get(&link.node_id)
            .ok_or_else(|| DriverError::ParentNotFound {
                id: link.node_id.clone(),
            })?;
        if !parent.kind().is_container() {
            return Err(DriverError::NotAContainer {
                id: link.node_id.clone(),
            }
            .into());
        }
        let id_taken = inner.nodes.contains_key(&node.id);
        if id_taken && !allow_overwrite {
            return Err(DriverError::NodeExists {
                id: node.id.clone(),
            }
            .into());
        }
        let occupant = inner.slot(&link.node_id, &link.key).cloned();
        if let Some(occupant) = &occupant
            && occupant != &node.id
            && !allow_overwrite
        {
            return Err(DriverError::KeyOccupied {
                parent: link.node_id.clone(),
                key: link.key.clone(),
            }
            .into());
        }

        // The parent must survive the overwrite: attaching beneath a node
        // that is itself about to be removed would orphan the insert.
        let mut doomed = Vec::new();
        if id_taken {
            doomed.push(node.id.clone());
        }
        if let Some(occupant) = &occupant
            && occupant != &node.id
        {
            doomed.push(occupant.clone());
        }
        let mut cursor = Some(link.node_id.clone());
        while let Some(current) = cursor {
            if doomed.contains(&current) {
                return Err(DriverError::ParentNotFound {
                    id: link.node_id.clone(),
                }
                .into());
            }
            cursor = inner
                .nodes
                .get(&current)
                .and_then(|n| n.parent())
                .map(|l| l.node_id.clone());
        }

        let clock = inner.clock + 1;
        if id_taken {
            let existing = inner.node(&node.id)?.clone();
            inner.unlink_from_parent(&existing, clock);
            inner.remove_subtree(&node.id, clock);
        }
        if let Some(occupant) = occupant
            && occupant != node.id
            && inner.nodes.contains_key(&occupant)
        {
            inner.remove_subtree(&occupant, clock);
        }
        inner.insert_node(node, clock);
        inner.clock = clock;
        Ok(())
    }

    async fn move_sibling(&self, id: &NodeId, new_pos: Position) -> Result<()> {
        if id.is_root() {
            return Ok(());
        }
        let mut inner = self.lock();
        let node = inner.node(id)?;
        let Some(link) = node.parent().cloned() else {
            return Ok(());
        };
        if link.key == new_pos.as_str() {
            return Ok(());
        }
        if inner.slot(&link.node_id, new_pos.as_str()).is_some() {
            return Err(DriverError::KeyOccupied {
                parent: link.node_id.clone(),
                key: new_pos.as_str().to_string(),
            }
            .into());
        }

        let clock = inner.clock + 1;
        if let Some(slots) = inner.children.get_mut(&link.node_id) {
            slots.remove(&link.key);
            slots.insert(new_pos.as_str().to_string(), id.clone());
        }
        inner.log_removal(clock, link.node_id.clone(), link.key.clone());
        inner.log_ref(
            clock,
            link.node_id.clone(),
            new_pos.as_str().to_string(),
            id.clone(),
        );
        if let Some(node) = inner.nodes.get_mut(id) {
            node.crdt.set_parent_key(new_pos.as_str());
        }
        let new_link = ParentLink::new(link.node_id.clone(), new_pos.as_str());
        let parent_value = parent_to_value(Some(&new_link));
        inner.log_value(clock, id.clone(), PARENT_KEY.to_string(), parent_value);
        inner.clock = clock;
        Ok(())
    }

    async fn delete_node(&self, id: &NodeId) -> Result<()> {
        if id.is_root() {
            return Ok(());
        }
        let mut inner = self.lock();
        let node = inner.node(id)?.clone();
        let clock = inner.clock + 1;
        inner.unlink_from_parent(&node, clock);
        inner.remove_subtree(id, clock);
        inner.clock = clock;
        debug!(%id, clock, "deleted subtree");
        Ok(())
    }

    async fn delete_child_key(&self, id: &NodeId, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.node(id)?;

        let has_field = match inner.nodes.get(id).map(|node| &node.crdt) {
            Some(CrdtNode::Object { data, .. }) => data.contains_key(key),
            _ => false,
        };
        if has_field {
            let clock = inner.clock + 1;
            if let Some(node) = inner.nodes.get_mut(id)
                && let CrdtNode::Object { data, .. } = &mut node.crdt
            {
                data.shift_remove(key);
            }
            inner.log_removal(clock, id.clone(), key.to_string());
            inner.clock = clock;
            return Ok(());
        }

        if let Some(child) = inner.slot(id, key).cloned() {
            let clock = inner.clock + 1;
            if let Some(slots) = inner.children.get_mut(id) {
                slots.remove(key);
            }
            inner.log_removal(clock, id.clone(), key.to_string());
            inner.remove_subtree(&child, clock);
            inner.clock = clock;
        }
        Ok(())
    }

    async fn set_object_data(
        &self,
        id: &NodeId,
        data: JsonObject,
        allow_overwrite: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        let node = inner.node(id)?;
        if node.kind() != NodeKind::Object {
            return Err(DriverError::NotAnObject { id: id.clone() }.into());
        }

        let colliding: Vec<(String, NodeId)> = data
            .keys()
            .filter_map(|key| inner.slot(id, key).map(|child| (key.clone(), child.clone())))
            .collect();
        if let Some((key, _)) = colliding.first()
            && !allow_overwrite
        {
            return Err(DriverError::ChildKeyCollision {
                id: id.clone(),
                key: key.clone(),
            }
            .into());
        }

        let clock = inner.clock + 1;
        for (key, child) in colliding {
            if let Some(slots) = inner.children.get_mut(id) {
                slots.remove(&key);
            }
            // No removal row: the value write below replaces the slot.
            inner.remove_subtree(&child, clock);
        }
        for (key, value) in &data {
            inner.log_value(clock, id.clone(), key.clone(), value.clone());
        }
        if let Some(node) = inner.nodes.get_mut(id)
            && let CrdtNode::Object { data: fields, .. } = &mut node.crdt
        {
            for (key, value) in data {
                fields.insert(key, value);
            }
        }
        inner.clock = clock;
        Ok(())
    }

    async fn get_snapshot(&self, low_memory: bool) -> Result<TreeSnapshot> {
        let inner = self.lock();
        Ok(TreeSnapshot::from_nodes(
            inner.clock,
            inner.nodes.values().cloned(),
            low_memory,
        ))
    }

    async fn clock(&self) -> Result<u64> {
        Ok(self.lock().clock)
    }

    async fn delta_since(&self, since: u64) -> Result<NodeDelta> {
        let inner = self.lock();
        // Later log entries within the same clock supersede earlier ones.
        let mut latest: BTreeMap<(NodeId, String), &VersionRow> = BTreeMap::new();
        for row in &inner.versions {
            if row.clock > since {
                latest.insert((row.nid.clone(), row.key.clone()), row);
            }
        }
        let mut delta = NodeDelta::new();
        for ((nid, key), row) in latest {
            match (&row.jval, &row.ref_id) {
                (None, None) => delta.remove_key(&nid, key),
                (_, Some(child)) => delta.set_ref(&nid, key, child.clone()),
                (Some(value), None) => delta.set_value(&nid, key, value.clone()),
            }
        }
        Ok(delta)
    }

    async fn full_delta(&self) -> Result<NodeDelta> {
        let inner = self.lock();
        let mut delta = NodeDelta::new();
        for node in inner.nodes.values() {
            for (key, value) in node.value_rows() {
                delta.set_value(&node.id, key, value);
            }
        }
        for (parent, slots) in &inner.children {
            for (key, child) in slots {
                delta.set_ref(parent, key.clone(), child.clone());
            }
        }
        Ok(delta)
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.lock().meta.get(key).cloned())
    }

    async fn put_meta(&self, key: &str, value: Value) -> Result<()> {
        self.lock().meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        self.lock().meta.remove(key);
        Ok(())
    }

    async fn next_actor(&self) -> Result<u64> {
        let mut inner = self.lock();
        inner.next_actor += 1;
        Ok(inner.next_actor)
    }

    async fn append_ydoc_update(&self, doc_id: &str, update: &[u8]) -> Result<()> {
        self.lock()
            .ydocs
            .entry(doc_id.to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn get_ydoc_updates(&self, doc_id: &str) -> Result<Vec<Vec<u8>>> {
        Ok(self.lock().ydocs.get(doc_id).cloned().unwrap_or_default())
    }

    async fn put_session(
        &self,
        key: &str,
        value: Value,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.lock()
            .sessions
            .insert(key.to_string(), LeasedSession { value, expires_at });
        Ok(())
    }

    async fn get_session(&self, key: &str) -> Result<Option<LeasedSession>> {
        Ok(self.lock().sessions.get(key).cloned())
    }

    async fn delete_session(&self, key: &str) -> Result<()> {
        self.lock().sessions.remove(key);
        Ok(())
    }

    async fn reset_nodes(&self, nodes: Vec<StorageNode>) -> Result<()> {
        let mut inner = self.lock();
        inner.nodes.clear();
        inner.children.clear();
        inner.versions.clear();
        let clock = inner.clock + 1;
        let mut has_root = false;
        for node in nodes {
            has_root |= node.id.is_root();
            inner.insert_node(node, clock);
        }
        if !has_root {
            inner.insert_node(StorageNode::root(), clock);
        }
        inner.clock = clock;
        debug!(clock, "node tree reset");
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
