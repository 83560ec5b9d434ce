//! Storage node model: the addressable units of the replicated document tree.
//!
//! A document is a flat arena of [`StorageNode`]s addressed by [`NodeId`],
//! with parent/child relations expressed as id references rather than live
//! pointers. Exactly one root node (id `"root"`, an OBJECT with no parent)
//! always exists, even when the document is logically empty. Every non-root
//! node carries a [`ParentLink`]; list children use fractional
//! [`Position`](crate::pos::Position) strings as their parent key, object
//! and map children use plain strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{KIND_KEY, PARENT_KEY, ROOT_ID, VALUE_KEY};

/// JSON object payload type used for static OBJECT fields.
///
/// With serde_json's `preserve_order` feature this keeps insertion order,
/// which the projection layer relies on for stable output.
pub type JsonObject = serde_json::Map<String, Value>;

/// Identifier of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// The id of the immortal root node.
    pub fn root() -> Self {
        NodeId(ROOT_ID.to_string())
    }

    /// Whether this id addresses the root node.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// The kind of a CRDT node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// JSON-object-like node with static fields and keyed children.
    Object,
    /// Ordered container; children attach under fractional positions.
    List,
    /// Unordered keyed container.
    Map,
    /// A single opaque JSON value, used as a list-item leaf.
    Register,
}

impl NodeKind {
    /// Whether nodes of this kind can hold CRDT children.
    pub fn is_container(self) -> bool {
        !matches!(self, NodeKind::Register)
    }

    /// Stable string name, also used as the `$kind` row value in drivers.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Object => "Object",
            NodeKind::List => "List",
            NodeKind::Map => "Map",
            NodeKind::Register => "Register",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "Object" => Some(NodeKind::Object),
            "List" => Some(NodeKind::List),
            "Map" => Some(NodeKind::Map),
            "Register" => Some(NodeKind::Register),
            _ => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a node is attached in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentLink {
    /// Id of the parent container node.
    pub node_id: NodeId,
    /// Key under the parent: a plain string for objects/maps, a fractional
    /// position string for lists.
    pub key: String,
}

impl ParentLink {
    pub fn new(node_id: impl Into<NodeId>, key: impl Into<String>) -> Self {
        ParentLink {
            node_id: node_id.into(),
            key: key.into(),
        }
    }
}

/// The CRDT payload of a storage node, one variant per node kind.
///
/// Matching on this enum is exhaustive, so adding a kind is a compile-time
/// event for every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CrdtNode {
    /// Holds static JSON fields directly; CRDT children attach separately.
    Object {
        #[serde(default)]
        data: JsonObject,
        /// `None` only for the root node.
        #[serde(default)]
        parent: Option<ParentLink>,
    },
    /// Ordered container.
    List { parent: ParentLink },
    /// Unordered keyed container.
    Map { parent: ParentLink },
    /// A single opaque value.
    Register { data: Value, parent: ParentLink },
}

impl CrdtNode {
    /// The node kind of this payload.
    pub fn kind(&self) -> NodeKind {
        match self {
            CrdtNode::Object { .. } => NodeKind::Object,
            CrdtNode::List { .. } => NodeKind::List,
            CrdtNode::Map { .. } => NodeKind::Map,
            CrdtNode::Register { .. } => NodeKind::Register,
        }
    }

    /// The parent link, `None` only for the root.
    pub fn parent(&self) -> Option<&ParentLink> {
        match self {
            CrdtNode::Object { parent, .. } => parent.as_ref(),
            CrdtNode::List { parent }
            | CrdtNode::Map { parent }
            | CrdtNode::Register { parent, .. } => Some(parent),
        }
    }

    /// Rewrites the parent key, used when a sibling is repositioned.
    ///
    /// No-op for the root, which has no parent.
    pub fn set_parent_key(&mut self, key: impl Into<String>) {
        match self {
            CrdtNode::Object { parent, .. } => {
                if let Some(link) = parent {
                    link.key = key.into();
                }
            }
            CrdtNode::List { parent }
            | CrdtNode::Map { parent }
            | CrdtNode::Register { parent, .. } => parent.key = key.into(),
        }
    }
}

/// One addressable unit of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: NodeId,
    pub crdt: CrdtNode,
}

impl StorageNode {
    /// The canonical empty root node.
    pub fn root() -> Self {
        StorageNode {
            id: NodeId::root(),
            crdt: CrdtNode::Object {
                data: JsonObject::new(),
                parent: None,
            },
        }
    }

    /// A non-root OBJECT node with the given static fields.
    pub fn new_object(id: impl Into<NodeId>, parent: ParentLink, data: JsonObject) -> Self {
        StorageNode {
            id: id.into(),
            crdt: CrdtNode::Object {
                data,
                parent: Some(parent),
            },
        }
    }

    /// A LIST node.
    pub fn new_list(id: impl Into<NodeId>, parent: ParentLink) -> Self {
        StorageNode {
            id: id.into(),
            crdt: CrdtNode::List { parent },
        }
    }

    /// A MAP node.
    pub fn new_map(id: impl Into<NodeId>, parent: ParentLink) -> Self {
        StorageNode {
            id: id.into(),
            crdt: CrdtNode::Map { parent },
        }
    }

    /// A REGISTER node holding a single value.
    pub fn new_register(id: impl Into<NodeId>, parent: ParentLink, data: Value) -> Self {
        StorageNode {
            id: id.into(),
            crdt: CrdtNode::Register { data, parent },
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.crdt.kind()
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.crdt.parent()
    }

    /// Flattens this node into its per-key value rows, the representation
    /// both drivers persist and deltas carry: `$kind`, `$parent`, the static
    /// OBJECT fields, and `$value` for registers. Child refs are rows on the
    /// parent and are not included here.
    pub(crate) fn value_rows(&self) -> Vec<(String, Value)> {
        let mut rows = vec![
            (KIND_KEY.to_string(), Value::String(self.kind().as_str().to_string())),
            (PARENT_KEY.to_string(), parent_to_value(self.parent())),
        ];
        match &self.crdt {
            CrdtNode::Object { data, .. } => {
                for (k, v) in data {
                    rows.push((k.clone(), v.clone()));
                }
            }
            CrdtNode::Register { data, .. } => {
                rows.push((VALUE_KEY.to_string(), data.clone()));
            }
            CrdtNode::List { .. } | CrdtNode::Map { .. } => {}
        }
        rows
    }

    /// Inverse of [`value_rows`]: rebuilds a node from its persisted per-key
    /// rows. Returns `None` when the rows are not a well-formed node (missing
    /// or unknown `$kind`, non-root node without a `$parent` link).
    ///
    /// [`value_rows`]: StorageNode::value_rows
    pub(crate) fn from_value_rows(
        id: NodeId,
        rows: impl IntoIterator<Item = (String, Value)>,
    ) -> Option<Self> {
        let mut kind = None;
        let mut parent = None;
        let mut value = Value::Null;
        let mut data = JsonObject::new();
        for (key, val) in rows {
            match key.as_str() {
                KIND_KEY => kind = val.as_str().and_then(NodeKind::parse),
                PARENT_KEY => parent = parent_from_value(&val),
                VALUE_KEY => value = val,
                _ => {
                    data.insert(key, val);
                }
            }
        }
        let crdt = match kind? {
            NodeKind::Object => {
                if parent.is_none() && !id.is_root() {
                    return None;
                }
                CrdtNode::Object { data, parent }
            }
            NodeKind::List => CrdtNode::List { parent: parent? },
            NodeKind::Map => CrdtNode::Map { parent: parent? },
            NodeKind::Register => CrdtNode::Register {
                data: value,
                parent: parent?,
            },
        };
        Some(StorageNode { id, crdt })
    }
}

pub(crate) fn parent_to_value(parent: Option<&ParentLink>) -> Value {
    match parent {
        Some(link) => Value::Array(vec![
            Value::String(link.node_id.as_str().to_string()),
            Value::String(link.key.clone()),
        ]),
        None => Value::Null,
    }
}

pub(crate) fn parent_from_value(value: &Value) -> Option<ParentLink> {
    let arr = value.as_array()?;
    match arr.as_slice() {
        [Value::String(id), Value::String(key)] => Some(ParentLink::new(id.as_str(), key.as_str())),
        _ => None,
    }
}
