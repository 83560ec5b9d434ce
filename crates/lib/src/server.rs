//! Server-side application of storage wire ops.
//!
//! A server session decodes [`ClientWireOp`]s from its transport, applies
//! each against its [`StorageDriver`], and broadcasts the resulting
//! [`NodeDelta`] (flattened via [`NodeDelta::into_wire`]) to every connected
//! client. Precondition failures surface as driver errors and produce no
//! state change; the caller decides whether to report or drop the op.

use tracing::debug;

use crate::Result;
use crate::delta::NodeDelta;
use crate::driver::StorageDriver;
use crate::node::{ParentLink, StorageNode};
use crate::protocol::ClientWireOp;

/// Applies one wire op against the driver and returns the net delta the
/// mutation produced.
///
/// The delta is computed as everything committed after the clock observed
/// before the op. Mutations are serialized per driver, so under exclusive
/// use the delta contains exactly this op's writes; concurrent writers fold
/// into it, which is harmless since deltas are idempotent to replay.
pub async fn apply_op(driver: &dyn StorageDriver, op: &ClientWireOp) -> Result<NodeDelta> {
    let before = driver.clock().await?;
    debug!(node = %op.target(), clock = before, "Applying wire op");

    match op {
        ClientWireOp::CreateObject {
            id,
            parent_id,
            parent_key,
            data,
        } => {
            let node = StorageNode::new_object(
                id.clone(),
                ParentLink::new(parent_id.clone(), parent_key.clone()),
                data.clone(),
            );
            driver.set_child(node, true).await?;
        }
        ClientWireOp::CreateList {
            id,
            parent_id,
            parent_key,
        } => {
            let node = StorageNode::new_list(
                id.clone(),
                ParentLink::new(parent_id.clone(), parent_key.clone()),
            );
            driver.set_child(node, true).await?;
        }
        ClientWireOp::CreateMap {
            id,
            parent_id,
            parent_key,
        } => {
            let node = StorageNode::new_map(
                id.clone(),
                ParentLink::new(parent_id.clone(), parent_key.clone()),
            );
            driver.set_child(node, true).await?;
        }
        ClientWireOp::CreateRegister {
            id,
            parent_id,
            parent_key,
            data,
        } => {
            let node = StorageNode::new_register(
                id.clone(),
                ParentLink::new(parent_id.clone(), parent_key.clone()),
                data.clone(),
            );
            driver.set_child(node, true).await?;
        }
        ClientWireOp::DeleteCrdt { id } => {
            driver.delete_node(id).await?;
        }
        ClientWireOp::SetParentKey { id, new_pos } => {
            driver.move_sibling(id, new_pos.clone()).await?;
        }
        ClientWireOp::UpdateObject { id, data } => {
            driver.set_object_data(id, data.clone(), true).await?;
        }
        ClientWireOp::DeleteObjectKey { id, key } => {
            driver.delete_child_key(id, key).await?;
        }
    }

    driver.delta_since(before).await
}
