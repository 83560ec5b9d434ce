//! Storage-layer deltas: the minimal description of a tree state transition.
//!
//! A [`NodeDelta`] is the triple `(removed, values, refs)` keyed by node id
//! that a committed driver transaction produces. `removed[nid]` lists
//! deleted static/child keys, `values[nid][key]` carries newly set JSON
//! values, and `refs[nid][key]` carries newly set child-node ids. Deltas are
//! the unit of synchronization between layers: drivers produce them,
//! reconciling client caches consume their flattened wire form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::constants::REF_MARKER;
use crate::node::NodeId;
use crate::protocol::{Delta, OpId};

/// A state transition of the node tree between two clock points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDelta {
    /// Deleted static/child keys per node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<NodeId, Vec<String>>,
    /// Newly set scalar/JSON values per node and key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<NodeId, BTreeMap<String, Value>>,
    /// Newly set child-node refs per node and key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub refs: BTreeMap<NodeId, BTreeMap<String, NodeId>>,
}

impl NodeDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.values.is_empty() && self.refs.is_empty()
    }

    /// Records a key removal, displacing any value/ref previously recorded
    /// for the same `(node, key)`.
    pub fn remove_key(&mut self, nid: &NodeId, key: impl Into<String>) {
        let key = key.into();
        if let Some(vals) = self.values.get_mut(nid) {
            vals.remove(&key);
        }
        if let Some(refs) = self.refs.get_mut(nid) {
            refs.remove(&key);
        }
        let removed = self.removed.entry(nid.clone()).or_default();
        if !removed.contains(&key) {
            removed.push(key);
        }
    }

    /// Records a value write, displacing a removal of the same key.
    pub fn set_value(&mut self, nid: &NodeId, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.undo_removal(nid, &key);
        self.values.entry(nid.clone()).or_default().insert(key, value);
    }

    /// Records a child-ref write, displacing a removal of the same key.
    pub fn set_ref(&mut self, nid: &NodeId, key: impl Into<String>, child: NodeId) {
        let key = key.into();
        self.undo_removal(nid, &key);
        self.refs.entry(nid.clone()).or_default().insert(key, child);
    }

    fn undo_removal(&mut self, nid: &NodeId, key: &str) {
        if let Some(removed) = self.removed.get_mut(nid) {
            removed.retain(|k| k != key);
            if removed.is_empty() {
                self.removed.remove(nid);
            }
        }
    }

    /// Folds `other` into `self`; `other` wins where both touch a key.
    pub fn merge(&mut self, other: NodeDelta) {
        for (nid, keys) in other.removed {
            for key in keys {
                self.remove_key(&nid, key);
            }
        }
        for (nid, vals) in other.values {
            for (key, value) in vals {
                self.set_value(&nid, key, value);
            }
        }
        for (nid, refs) in other.refs {
            for (key, child) in refs {
                self.set_ref(&nid, key, child);
            }
        }
    }

    /// Flattens into the client-facing wire [`Delta`].
    ///
    /// Keys become `"{nid}!{key}"` composites; refs become `{"$ref": id}`
    /// marker objects so the receiving cache stores them like any value.
    pub fn into_wire(self, op_id: Option<OpId>) -> Delta {
        let mut deleted = Vec::new();
        for (nid, keys) in &self.removed {
            for key in keys {
                deleted.push(flat_key(nid, key));
            }
        }
        let mut updated = Vec::new();
        for (nid, vals) in &self.values {
            for (key, value) in vals {
                updated.push((flat_key(nid, key), value.clone()));
            }
        }
        for (nid, refs) in &self.refs {
            for (key, child) in refs {
                updated.push((flat_key(nid, key), json!({ REF_MARKER: child.as_str() })));
            }
        }
        Delta {
            op_id,
            deleted,
            updated,
        }
    }
}

fn flat_key(nid: &NodeId, key: &str) -> String {
    format!("{nid}!{key}")
}
