//! Client/server wire protocol: message shapes, ops, and flat deltas.
//!
//! These are transport-agnostic message types; sockets are an injected
//! abstraction and the byte format is whatever the transport's serde
//! encoding produces. The handshake contract: [`ServerMsg::First`] must be
//! the first message on a fresh connection, anything else (or a second
//! `First`) is a protocol violation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::{JsonObject, NodeId};
use crate::pos::Position;

/// Globally unique id of a client-originated op.
///
/// The reference shape is `"<base-26 client key>:<counter>"`, e.g. `"KQZ:7"`,
/// monotonically increasing per client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(String);

impl OpId {
    pub fn new(id: impl Into<String>) -> Self {
        OpId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named, idempotent-by-id client mutation intention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub name: String,
    pub args: Vec<Value>,
}

/// A flat delta as exchanged between server and client caches.
///
/// Produced either by a client cache transaction (`op_id` set) or by
/// flattening a storage [`NodeDelta`](crate::delta::NodeDelta). Deletions
/// apply before updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OpId>,
    #[serde(default)]
    pub deleted: Vec<String>,
    #[serde(default)]
    pub updated: Vec<(String, Value)>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.updated.is_empty()
    }
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMsg {
    /// Handshake: must be the first message on a new connection.
    First {
        /// Actor id assigned to this client.
        actor: u64,
        /// Opaque session resume key.
        session_key: String,
        /// The server's current clock, so the client can decide whether it
        /// needs a catch-up.
        server_clock: u64,
    },
    /// Authoritative deltas.
    Delta {
        deltas: Vec<Delta>,
        server_clock: u64,
        /// When set, the deltas are a complete-state replacement rather than
        /// an increment; the client resets its cache before applying.
        #[serde(default)]
        full_cc: bool,
        /// Marks the response to a catch-up request; afterwards the client
        /// may resume sending its own ops.
        #[serde(default)]
        is_initial_sync: bool,
    },
}

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMsg {
    /// Request state newer than `since`.
    CatchUp { since: u64 },
    /// A single named mutation intention.
    Op { op: Op },
}

/// Storage node wire ops, the vocabulary a server applies against its
/// storage driver.
///
/// Preconditions (enforced by the driver, assumed by well-behaved callers):
/// creation ops require `parent_id` to reference an existing container node;
/// mutation/deletion ops require the target to exist, and the object-only
/// ops require it to be an OBJECT node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ClientWireOp {
    CreateObject {
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        #[serde(default)]
        data: JsonObject,
    },
    CreateList {
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateMap {
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
    },
    CreateRegister {
        id: NodeId,
        parent_id: NodeId,
        parent_key: String,
        data: Value,
    },
    DeleteCrdt {
        id: NodeId,
    },
    SetParentKey {
        id: NodeId,
        new_pos: Position,
    },
    UpdateObject {
        id: NodeId,
        data: JsonObject,
    },
    DeleteObjectKey {
        id: NodeId,
        key: String,
    },
}

impl ClientWireOp {
    /// The id of the node this op targets or creates.
    pub fn target(&self) -> &NodeId {
        match self {
            ClientWireOp::CreateObject { id, .. }
            | ClientWireOp::CreateList { id, .. }
            | ClientWireOp::CreateMap { id, .. }
            | ClientWireOp::CreateRegister { id, .. }
            | ClientWireOp::DeleteCrdt { id }
            | ClientWireOp::SetParentKey { id, .. }
            | ClientWireOp::UpdateObject { id, .. }
            | ClientWireOp::DeleteObjectKey { id, .. } => id,
        }
    }
}
