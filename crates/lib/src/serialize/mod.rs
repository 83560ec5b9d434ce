//! Tree-to-JSON projection.
//!
//! Two independent serializers over a [`TreeSnapshot`], guaranteed to produce
//! identical output for any valid tree:
//!
//! - **Eager**: [`to_plain_lson`] / [`to_lossy_json`] build an in-memory
//!   [`Value`].
//! - **Lazy**: [`JsonChunks`] yields the same JSON text in chunks from an
//!   explicit work stack, so arbitrarily large documents stream without full
//!   materialization.
//!
//! Node-kind mapping (PlainLson): OBJECT →
//! `{"liveblocksType":"LiveObject","data":{...}}` with static fields first
//! and children after (a child shadows a static field of the same key);
//! LIST → `{"liveblocksType":"LiveList","data":[...]}` with children in
//! position order; MAP → `{"liveblocksType":"LiveMap","data":{...}}`;
//! REGISTER → its bare JSON value. The root is always a LiveObject.
//!
//! LossyJson is the same tree without the type/data envelope: plain objects,
//! arrays, and bare values. Used for snapshot export where full-fidelity
//! reconstruction is not required.

pub mod errors;

use std::collections::HashSet;

pub use errors::SerializeError;
use serde_json::Value;

use crate::Result;
use crate::driver::TreeSnapshot;
use crate::node::{CrdtNode, JsonObject, NodeId, StorageNode};

/// Which projection flavor to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    PlainLson,
    LossyJson,
}

/// Eagerly projects the snapshot to PlainLson.
pub fn to_plain_lson(snapshot: &TreeSnapshot) -> Result<Value> {
    let root = snapshot.get_root()?;
    eager_node(snapshot, root, Flavor::PlainLson)
}

/// Eagerly projects the snapshot to lossy JSON.
pub fn to_lossy_json(snapshot: &TreeSnapshot) -> Result<Value> {
    let root = snapshot.get_root()?;
    eager_node(snapshot, root, Flavor::LossyJson)
}

fn eager_node(snapshot: &TreeSnapshot, node: &StorageNode, flavor: Flavor) -> Result<Value> {
    match &node.crdt {
        CrdtNode::Object { data, .. } => {
            let children = snapshot.iter_children(&node.id);
            let shadowed: HashSet<&str> = children.iter().map(|(key, _)| key.as_str()).collect();
            let mut map = JsonObject::new();
            for (key, value) in data {
                if !shadowed.contains(key.as_str()) {
                    map.insert(key.clone(), value.clone());
                }
            }
            for (key, child) in children {
                map.insert(key, eager_child(snapshot, &child, flavor)?);
            }
            Ok(envelope(flavor, "LiveObject", Value::Object(map)))
        }
        CrdtNode::List { .. } => {
            let mut items = Vec::new();
            for (_, child) in snapshot.iter_children(&node.id) {
                items.push(eager_child(snapshot, &child, flavor)?);
            }
            Ok(envelope(flavor, "LiveList", Value::Array(items)))
        }
        CrdtNode::Map { .. } => {
            let mut map = JsonObject::new();
            for (key, child) in snapshot.iter_children(&node.id) {
                map.insert(key, eager_child(snapshot, &child, flavor)?);
            }
            Ok(envelope(flavor, "LiveMap", Value::Object(map)))
        }
        CrdtNode::Register { data, .. } => Ok(data.clone()),
    }
}

fn eager_child(snapshot: &TreeSnapshot, id: &NodeId, flavor: Flavor) -> Result<Value> {
    let child = snapshot
        .get_node(id)
        .ok_or_else(|| SerializeError::DanglingChild { id: id.clone() })?;
    eager_node(snapshot, child, flavor)
}

fn envelope(flavor: Flavor, marker: &str, data: Value) -> Value {
    match flavor {
        Flavor::PlainLson => {
            let mut map = JsonObject::new();
            map.insert(
                "liveblocksType".to_string(),
                Value::String(marker.to_string()),
            );
            map.insert("data".to_string(), data);
            Value::Object(map)
        }
        Flavor::LossyJson => data,
    }
}

/// One pending unit of lazy serialization work.
enum Task {
    Lit(&'static str),
    Owned(String),
    Node(NodeId),
}

/// A restartable chunk generator over a snapshot.
///
/// Yields pieces of the same JSON text the eager projection would produce;
/// concatenating all chunks gives a byte-identical document. The iterator
/// holds an explicit work stack instead of recursing, so stack depth is
/// bounded regardless of tree depth.
pub struct JsonChunks<'a> {
    snapshot: &'a TreeSnapshot,
    stack: Vec<Task>,
    flavor: Flavor,
    failed: bool,
}

impl<'a> JsonChunks<'a> {
    /// Streams the PlainLson projection.
    pub fn plain_lson(snapshot: &'a TreeSnapshot) -> Self {
        Self::new(snapshot, Flavor::PlainLson)
    }

    /// Streams the lossy JSON projection.
    pub fn lossy_json(snapshot: &'a TreeSnapshot) -> Self {
        Self::new(snapshot, Flavor::LossyJson)
    }

    fn new(snapshot: &'a TreeSnapshot, flavor: Flavor) -> Self {
        JsonChunks {
            snapshot,
            stack: vec![Task::Node(NodeId::root())],
            flavor,
            failed: false,
        }
    }

    /// Expands a node into its chunk tasks, pushed in reverse so the stack
    /// pops them in document order.
    fn expand(&mut self, id: &NodeId) -> Result<()> {
        let node = self
            .snapshot
            .get_node(id)
            .ok_or_else(|| SerializeError::DanglingChild { id: id.clone() })?;

        let mut tasks = Vec::new();
        match &node.crdt {
            CrdtNode::Object { data, .. } => {
                let children = self.snapshot.iter_children(&node.id);
                let shadowed: HashSet<&str> =
                    children.iter().map(|(key, _)| key.as_str()).collect();
                tasks.push(self.open_brace("LiveObject"));
                let mut first = true;
                for (key, value) in data {
                    if shadowed.contains(key.as_str()) {
                        continue;
                    }
                    if !first {
                        tasks.push(Task::Lit(","));
                    }
                    first = false;
                    tasks.push(Task::Owned(encode_key(key)?));
                    tasks.push(Task::Owned(encode_json(value)?));
                }
                for (key, child) in children {
                    if !first {
                        tasks.push(Task::Lit(","));
                    }
                    first = false;
                    tasks.push(Task::Owned(encode_key(&key)?));
                    tasks.push(Task::Node(child));
                }
                tasks.push(self.close_brace());
            }
            CrdtNode::List { .. } => {
                tasks.push(self.open_bracket());
                let mut first = true;
                for (_, child) in self.snapshot.iter_children(&node.id) {
                    if !first {
                        tasks.push(Task::Lit(","));
                    }
                    first = false;
                    tasks.push(Task::Node(child));
                }
                tasks.push(self.close_bracket());
            }
            CrdtNode::Map { .. } => {
                tasks.push(self.open_brace("LiveMap"));
                let mut first = true;
                for (key, child) in self.snapshot.iter_children(&node.id) {
                    if !first {
                        tasks.push(Task::Lit(","));
                    }
                    first = false;
                    tasks.push(Task::Owned(encode_key(&key)?));
                    tasks.push(Task::Node(child));
                }
                tasks.push(self.close_brace());
            }
            CrdtNode::Register { data, .. } => {
                tasks.push(Task::Owned(encode_json(data)?));
            }
        }
        self.stack.extend(tasks.into_iter().rev());
        Ok(())
    }

    fn open_brace(&self, marker: &'static str) -> Task {
        match self.flavor {
            Flavor::PlainLson => {
                Task::Owned(format!("{{\"liveblocksType\":\"{marker}\",\"data\":{{"))
            }
            Flavor::LossyJson => Task::Lit("{"),
        }
    }

    fn close_brace(&self) -> Task {
        match self.flavor {
            Flavor::PlainLson => Task::Lit("}}"),
            Flavor::LossyJson => Task::Lit("}"),
        }
    }

    fn open_bracket(&self) -> Task {
        match self.flavor {
            Flavor::PlainLson => Task::Lit("{\"liveblocksType\":\"LiveList\",\"data\":["),
            Flavor::LossyJson => Task::Lit("["),
        }
    }

    fn close_bracket(&self) -> Task {
        match self.flavor {
            Flavor::PlainLson => Task::Lit("]}"),
            Flavor::LossyJson => Task::Lit("]"),
        }
    }

    /// Concatenates all remaining chunks.
    pub fn collect_string(self) -> Result<String> {
        let mut out = String::new();
        for chunk in self {
            out.push_str(&chunk?);
        }
        Ok(out)
    }
}

impl Iterator for JsonChunks<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.stack.pop()? {
                Task::Lit(text) => return Some(Ok(text.to_string())),
                Task::Owned(text) => return Some(Ok(text)),
                Task::Node(id) => {
                    if let Err(err) = self.expand(&id) {
                        self.failed = true;
                        return Some(Err(err));
                    }
                }
            }
        }
    }
}

fn encode_key(key: &str) -> Result<String> {
    let quoted = serde_json::to_string(key)
        .map_err(|e| SerializeError::Serialization { source: e })?;
    Ok(format!("{quoted}:"))
}

fn encode_json(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SerializeError::Serialization { source: e }.into())
}
