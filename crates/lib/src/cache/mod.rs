//! Layered transactional key/value cache.
//!
//! [`LayeredCache`] is an insertion-ordered key → JSON-value map with nested
//! transactions. The base layer holds committed state; each open transaction
//! is a layer of pending writes (`None` entries are tombstones). Reads see
//! the merged view across all layers, most recent wins. Committing folds the
//! top layer into the one below; rolling back discards it, including any
//! inner commits that were folded into it.
//!
//! The mutation engine keeps one long-lived transaction open for speculative
//! local state and runs every mutator inside a nested sub-transaction, so a
//! failing mutator can be rolled back without touching anything else.

pub mod errors;

pub use errors::CacheError;
use indexmap::IndexMap;
use serde_json::Value;

use crate::Result;
use crate::protocol::{Delta, OpId};

/// An ordered key/value store with nested transaction layers.
#[derive(Debug, Default, Clone)]
pub struct LayeredCache {
    /// Committed state; keys keep the order of their first insertion.
    base: IndexMap<String, Value>,
    /// Open transactions, innermost last. `None` marks a deletion.
    layers: Vec<IndexMap<String, Option<Value>>>,
}

impl LayeredCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks a key up through the layers, most recent write wins.
    pub fn get(&self, key: &str) -> Option<&Value> {
        for layer in self.layers.iter().rev() {
            if let Some(entry) = layer.get(key) {
                return entry.as_ref();
            }
        }
        self.base.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a key in the innermost open transaction (or the base layer when
    /// none is open). JSON `null` is a real value; use [`delete`] to remove.
    ///
    /// [`delete`]: LayeredCache::delete
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        match self.layers.last_mut() {
            Some(layer) => {
                layer.insert(key, Some(value));
            }
            None => {
                self.base.insert(key, value);
            }
        }
    }

    /// `set_opt(key, None)` is equivalent to `delete(key)`, mirroring
    /// mutators that treat an absent value as a removal.
    pub fn set_opt(&mut self, key: impl Into<String>, value: Option<Value>) {
        match value {
            Some(v) => self.set(key, v),
            None => self.delete(&key.into()),
        }
    }

    /// Deletes a key. A no-op if the key is not currently visible, so the
    /// transaction delta never reports spurious deletions.
    pub fn delete(&mut self, key: &str) {
        if !self.has(key) {
            return;
        }
        match self.layers.last_mut() {
            Some(layer) => {
                layer.insert(key.to_string(), None);
            }
            None => {
                self.base.shift_remove(key);
            }
        }
    }

    /// Number of visible keys.
    pub fn len(&self) -> usize {
        self.merged().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible keys: base-layer insertion order first, then keys introduced
    /// by open transactions in their own insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.merged().keys().map(|k| (*k).to_string()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.merged().values().map(|v| (*v).clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.merged()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    /// The merged view as a JSON object.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (k, v) in self.merged() {
            map.insert(k.to_string(), v.clone());
        }
        Value::Object(map)
    }

    fn merged(&self) -> IndexMap<&str, &Value> {
        let mut view: IndexMap<&str, &Value> = IndexMap::new();
        for (k, v) in &self.base {
            view.insert(k.as_str(), v);
        }
        for layer in &self.layers {
            for (k, entry) in layer {
                match entry {
                    Some(v) => {
                        view.insert(k.as_str(), v);
                    }
                    None => {
                        view.shift_remove(k.as_str());
                    }
                }
            }
        }
        view
    }

    /// Opens a nested transaction.
    pub fn start_transaction(&mut self) {
        self.layers.push(IndexMap::new());
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Folds the innermost transaction into the layer below it.
    pub fn commit(&mut self) -> Result<()> {
        let top = self
            .layers
            .pop()
            .ok_or(CacheError::NoTransaction { action: "commit" })?;
        match self.layers.last_mut() {
            Some(below) => {
                for (k, entry) in top {
                    below.insert(k, entry);
                }
            }
            None => {
                for (k, entry) in top {
                    match entry {
                        Some(v) => {
                            self.base.insert(k, v);
                        }
                        None => {
                            self.base.shift_remove(&k);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Discards the innermost transaction and everything folded into it.
    pub fn rollback(&mut self) -> Result<()> {
        self.layers.pop().ok_or(CacheError::NoTransaction {
            action: "roll back",
        })?;
        Ok(())
    }

    /// The changes accumulated in the innermost open transaction, tagged
    /// with the given op id.
    pub fn delta(&self, op_id: OpId) -> Result<Delta> {
        let top = self
            .layers
            .last()
            .ok_or(CacheError::NoTransaction { action: "diff" })?;
        let mut deleted = Vec::new();
        let mut updated = Vec::new();
        for (k, entry) in top {
            match entry {
                Some(v) => updated.push((k.clone(), v.clone())),
                None => deleted.push(k.clone()),
            }
        }
        Ok(Delta {
            op_id: Some(op_id),
            deleted,
            updated,
        })
    }
}
