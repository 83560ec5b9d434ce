//! Node tree storage operations for the SQL driver.
//!
//! Every mutation begins a database transaction, allocates its clock tick
//! with a row-locking UPDATE on the clock row, validates against the
//! committed rows, and writes both the `nodes` table and the `node_versions`
//! log at that tick. The tick becomes durable only on commit; dropping the
//! transaction on an error path rolls everything back, so a failed mutation
//! is never partially observable.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::Result;
use crate::constants::{CLOCK_META_KEY, PARENT_KEY};
use crate::delta::NodeDelta;
use crate::driver::LeasedSession;
use crate::driver::errors::DriverError;
use crate::driver::snapshot::TreeSnapshot;
use crate::node::{
    CrdtNode, JsonObject, NodeId, NodeKind, ParentLink, StorageNode, parent_to_value,
};
use crate::pos::Position;

use super::{SqlDriver, SqlxResultExt};

type Tx<'a> = sqlx::Transaction<'a, sqlx::Any>;

fn encode_value(value: &Value) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DriverError::SerializationFailed { source: e }.into())
}

fn decode_value(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| DriverError::DeserializationFailed { source: e }.into())
}

/// Read the clock row inside a transaction.
async fn read_clock_tx(tx: &mut Tx<'_>) -> Result<i64> {
    let row: Option<(String,)> = sqlx::query_as("SELECT jval FROM meta WHERE mkey = $1")
        .bind(CLOCK_META_KEY)
        .fetch_optional(&mut **tx)
        .await
        .sql_context("Failed to read clock")?;
    match row {
        Some((text,)) => text.parse().map_err(|_| {
            DriverError::Corrupt {
                reason: format!("clock row holds non-integer value {text:?}"),
            }
            .into()
        }),
        None => Ok(0),
    }
}

/// Allocate this mutation's clock tick inside a transaction.
///
/// The UPDATE takes a row lock on the clock row, so concurrent mutations
/// serialize on the tick and each commits at its own clock. The new value
/// becomes durable on commit; rollback reverts it.
async fn allocate_clock_tx(tx: &mut Tx<'_>) -> Result<i64> {
    let done =
        sqlx::query("UPDATE meta SET jval = CAST(CAST(jval AS INTEGER) + 1 AS TEXT) WHERE mkey = $1")
            .bind(CLOCK_META_KEY)
            .execute(&mut **tx)
            .await
            .sql_context("Failed to advance clock")?;
    if done.rows_affected() == 0 {
        return Err(DriverError::Corrupt {
            reason: "clock row missing, schema was never initialized".to_string(),
        }
        .into());
    }
    read_clock_tx(tx).await
}

/// Upsert one current-state row.
async fn upsert_node_row(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    nid: &str,
    rkey: &str,
    jval: Option<&str>,
    ref_id: Option<&str>,
) -> Result<()> {
    let sql = if driver.is_sqlite() {
        "INSERT OR REPLACE INTO nodes (nid, rkey, jval, ref_id) VALUES ($1, $2, $3, $4)"
    } else {
        "INSERT INTO nodes (nid, rkey, jval, ref_id) VALUES ($1, $2, $3, $4)
         ON CONFLICT (nid, rkey) DO UPDATE SET jval = EXCLUDED.jval, ref_id = EXCLUDED.ref_id"
    };
    sqlx::query(sql)
        .bind(nid)
        .bind(rkey)
        .bind(jval)
        .bind(ref_id)
        .execute(&mut **tx)
        .await
        .sql_context("Failed to upsert node row")?;
    Ok(())
}

/// Upsert one version-log row. Within a clock tick the last write for a
/// `(nid, rkey)` wins, mirroring the in-memory driver's log semantics.
async fn log_version(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    clock: i64,
    nid: &str,
    rkey: &str,
    jval: Option<&str>,
    ref_id: Option<&str>,
) -> Result<()> {
    let sql = if driver.is_sqlite() {
        "INSERT OR REPLACE INTO node_versions (nid, rkey, clock, jval, ref_id)
         VALUES ($1, $2, $3, $4, $5)"
    } else {
        "INSERT INTO node_versions (nid, rkey, clock, jval, ref_id)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (nid, rkey, clock) DO UPDATE SET
            jval = EXCLUDED.jval, ref_id = EXCLUDED.ref_id"
    };
    sqlx::query(sql)
        .bind(nid)
        .bind(rkey)
        .bind(clock)
        .bind(jval)
        .bind(ref_id)
        .execute(&mut **tx)
        .await
        .sql_context("Failed to append version row")?;
    Ok(())
}

async fn write_value(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    clock: i64,
    nid: &str,
    rkey: &str,
    value: &Value,
) -> Result<()> {
    let text = encode_value(value)?;
    upsert_node_row(driver, tx, nid, rkey, Some(&text), None).await?;
    log_version(driver, tx, clock, nid, rkey, Some(&text), None).await
}

async fn write_ref(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    clock: i64,
    nid: &str,
    rkey: &str,
    child: &str,
) -> Result<()> {
    upsert_node_row(driver, tx, nid, rkey, None, Some(child)).await?;
    log_version(driver, tx, clock, nid, rkey, None, Some(child)).await
}

/// Delete a current-state row and log the removal (null/null version row).
async fn write_removal(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    clock: i64,
    nid: &str,
    rkey: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM nodes WHERE nid = $1 AND rkey = $2")
        .bind(nid)
        .bind(rkey)
        .execute(&mut **tx)
        .await
        .sql_context("Failed to delete node row")?;
    log_version(driver, tx, clock, nid, rkey, None, None).await
}

/// Load a node's value rows within a transaction; `None` if the id has no
/// rows at all.
async fn load_node_tx(tx: &mut Tx<'_>, id: &NodeId) -> Result<Option<StorageNode>> {
    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT rkey, jval FROM nodes WHERE nid = $1 AND ref_id IS NULL")
            .bind(id.as_str())
            .fetch_all(&mut **tx)
            .await
            .sql_context("Failed to load node rows")?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut value_rows = Vec::with_capacity(rows.len());
    for (rkey, jval) in rows {
        let value = match jval {
            Some(text) => decode_value(&text)?,
            None => Value::Null,
        };
        value_rows.push((rkey, value));
    }
    StorageNode::from_value_rows(id.clone(), value_rows)
        .map(Some)
        .ok_or_else(|| {
            DriverError::Corrupt {
                reason: format!("rows for {id} do not form a node"),
            }
            .into()
        })
}

/// The child slot occupant at `(parent, key)`, if any, within a transaction.
async fn slot_tx(tx: &mut Tx<'_>, parent: &NodeId, key: &str) -> Result<Option<NodeId>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT ref_id FROM nodes WHERE nid = $1 AND rkey = $2")
            .bind(parent.as_str())
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .sql_context("Failed to read child slot")?;
    Ok(row.and_then(|(ref_id,)| ref_id.map(NodeId::new)))
}

/// Delete `id` and its whole subtree, logging removal rows for every row
/// that disappears. The caller handles the slot on the subtree's parent.
async fn remove_subtree(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    id: &NodeId,
    clock: i64,
) -> Result<()> {
    let mut stack = vec![id.clone()];
    while let Some(nid) = stack.pop() {
        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT rkey, ref_id FROM nodes WHERE nid = $1")
                .bind(nid.as_str())
                .fetch_all(&mut **tx)
                .await
                .sql_context("Failed to list subtree rows")?;
        for (rkey, ref_id) in rows {
            if let Some(child) = ref_id {
                stack.push(NodeId::new(child));
            }
            write_removal(driver, tx, clock, nid.as_str(), &rkey).await?;
        }
    }
    Ok(())
}

/// Write a node's own value rows plus the slot on its parent.
async fn insert_node(
    driver: &SqlDriver,
    tx: &mut Tx<'_>,
    node: &StorageNode,
    clock: i64,
) -> Result<()> {
    for (rkey, value) in node.value_rows() {
        write_value(driver, tx, clock, node.id.as_str(), &rkey, &value).await?;
    }
    if let Some(link) = node.parent() {
        write_ref(
            driver,
            tx,
            clock,
            link.node_id.as_str(),
            &link.key,
            node.id.as_str(),
        )
        .await?;
    }
    Ok(())
}

pub async fn get_node(driver: &SqlDriver, id: &NodeId) -> Result<StorageNode> {
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let node = load_node_tx(&mut tx, id).await?;
    node.ok_or_else(|| DriverError::NodeNotFound { id: id.clone() }.into())
}

pub async fn has_node(driver: &SqlDriver, id: &NodeId) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE nid = $1")
        .bind(id.as_str())
        .fetch_one(driver.pool())
        .await
        .sql_context("Failed to check node existence")?;
    Ok(count > 0)
}

pub async fn list_nodes(driver: &SqlDriver) -> Result<Vec<NodeId>> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT DISTINCT nid FROM nodes")
        .fetch_all(driver.pool())
        .await
        .sql_context("Failed to list nodes")?;
    Ok(rows.into_iter().map(|(nid,)| NodeId::new(nid)).collect())
}

pub async fn get_child_at(
    driver: &SqlDriver,
    parent: &NodeId,
    key: &str,
) -> Result<Option<NodeId>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT ref_id FROM nodes WHERE nid = $1 AND rkey = $2")
            .bind(parent.as_str())
            .bind(key)
            .fetch_optional(driver.pool())
            .await
            .sql_context("Failed to resolve child")?;
    Ok(row.and_then(|(ref_id,)| ref_id.map(NodeId::new)))
}

pub async fn get_next_sibling(
    driver: &SqlDriver,
    parent: &NodeId,
    pos: &Position,
) -> Result<Option<Position>> {
    // Position order is byte order; database TEXT collations (notably
    // Postgres locale collations) don't guarantee it, so compare in Rust.
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT rkey FROM nodes WHERE nid = $1 AND ref_id IS NOT NULL")
            .bind(parent.as_str())
            .fetch_all(driver.pool())
            .await
            .sql_context("Failed to list sibling slots")?;
    let next = rows
        .into_iter()
        .map(|(rkey,)| rkey)
        .filter(|rkey| rkey.as_str() > pos.as_str())
        .min();
    Ok(next.map(|rkey| Position::from(rkey.as_str())))
}

pub async fn set_child(driver: &SqlDriver, node: StorageNode, allow_overwrite: bool) -> Result<()> {
    let Some(link) = node.parent().cloned() else {
        return Err(DriverError::Corrupt {
            reason: format!("set_child of {} without a parent link", node.id),
        }
        .into());
    };

    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    let parent = load_node_tx(&mut tx, &link.node_id)
        .await?
        .ok_or_else(|| DriverError::ParentNotFound {
            id: link.node_id.clone(),
        })?;
    if !parent.kind().is_container() {
        return Err(DriverError::NotAContainer {
            id: link.node_id.clone(),
        }
        .into());
    }

    let existing = load_node_tx(&mut tx, &node.id).await?;
    if existing.is_some() && !allow_overwrite {
        return Err(DriverError::NodeExists {
            id: node.id.clone(),
        }
        .into());
    }
    let occupant = slot_tx(&mut tx, &link.node_id, &link.key).await?;
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

    // The parent must survive the overwrite: attaching beneath a node that
    // is itself about to be removed would orphan the insert.
    let mut doomed = Vec::new();
    if existing.is_some() {
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
        cursor = load_node_tx(&mut tx, &current)
            .await?
            .and_then(|n| n.parent().map(|l| l.node_id.clone()));
    }

    if let Some(existing) = existing {
        // Drop the replaced node's old slot before rewriting its subtree.
        if let Some(old_link) = existing.parent() {
            write_removal(driver, &mut tx, clock, old_link.node_id.as_str(), &old_link.key)
                .await?;
        }
        remove_subtree(driver, &mut tx, &node.id, clock).await?;
    }
    if let Some(occupant) = occupant
        && occupant != node.id
    {
        remove_subtree(driver, &mut tx, &occupant, clock).await?;
    }

    insert_node(driver, &mut tx, &node, clock).await?;
    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    Ok(())
}

pub async fn move_sibling(driver: &SqlDriver, id: &NodeId, new_pos: Position) -> Result<()> {
    if id.is_root() {
        return Ok(());
    }
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    let node = load_node_tx(&mut tx, id)
        .await?
        .ok_or_else(|| DriverError::NodeNotFound { id: id.clone() })?;
    let Some(link) = node.parent().cloned() else {
        return Ok(());
    };
    if link.key == new_pos.as_str() {
        return Ok(());
    }
    if slot_tx(&mut tx, &link.node_id, new_pos.as_str()).await?.is_some() {
        return Err(DriverError::KeyOccupied {
            parent: link.node_id.clone(),
            key: new_pos.as_str().to_string(),
        }
        .into());
    }

    write_removal(driver, &mut tx, clock, link.node_id.as_str(), &link.key).await?;
    write_ref(
        driver,
        &mut tx,
        clock,
        link.node_id.as_str(),
        new_pos.as_str(),
        id.as_str(),
    )
    .await?;
    let new_link = ParentLink::new(link.node_id.clone(), new_pos.as_str());
    let parent_value = parent_to_value(Some(&new_link));
    write_value(driver, &mut tx, clock, id.as_str(), PARENT_KEY, &parent_value).await?;

    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    Ok(())
}

pub async fn delete_node(driver: &SqlDriver, id: &NodeId) -> Result<()> {
    if id.is_root() {
        return Ok(());
    }
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    let node = load_node_tx(&mut tx, id)
        .await?
        .ok_or_else(|| DriverError::NodeNotFound { id: id.clone() })?;
    if let Some(link) = node.parent() {
        write_removal(driver, &mut tx, clock, link.node_id.as_str(), &link.key).await?;
    }
    remove_subtree(driver, &mut tx, id, clock).await?;

    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    debug!(%id, clock, "deleted subtree");
    Ok(())
}

pub async fn delete_child_key(driver: &SqlDriver, id: &NodeId, key: &str) -> Result<()> {
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    let node = load_node_tx(&mut tx, id)
        .await?
        .ok_or_else(|| DriverError::NodeNotFound { id: id.clone() })?;

    let has_field = matches!(
        &node.crdt,
        CrdtNode::Object { data, .. } if data.contains_key(key)
    );
    if has_field {
        write_removal(driver, &mut tx, clock, id.as_str(), key).await?;
        tx.commit()
            .await
            .sql_context("Failed to commit transaction")?;
        return Ok(());
    }

    if let Some(child) = slot_tx(&mut tx, id, key).await? {
        write_removal(driver, &mut tx, clock, id.as_str(), key).await?;
        remove_subtree(driver, &mut tx, &child, clock).await?;
        tx.commit()
            .await
            .sql_context("Failed to commit transaction")?;
    }
    // Neither a static field nor a child: silent no-op, transaction dropped.
    Ok(())
}

pub async fn set_object_data(
    driver: &SqlDriver,
    id: &NodeId,
    data: JsonObject,
    allow_overwrite: bool,
) -> Result<()> {
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    let node = load_node_tx(&mut tx, id)
        .await?
        .ok_or_else(|| DriverError::NodeNotFound { id: id.clone() })?;
    if node.kind() != NodeKind::Object {
        return Err(DriverError::NotAnObject { id: id.clone() }.into());
    }

    let mut colliding = Vec::new();
    for key in data.keys() {
        if let Some(child) = slot_tx(&mut tx, id, key).await? {
            if !allow_overwrite {
                return Err(DriverError::ChildKeyCollision {
                    id: id.clone(),
                    key: key.clone(),
                }
                .into());
            }
            colliding.push(child);
        }
    }
    for child in colliding {
        // The colliding slot row itself is replaced by the value write
        // below, so only the child subtree is removed here.
        remove_subtree(driver, &mut tx, &child, clock).await?;
    }
    for (key, value) in &data {
        write_value(driver, &mut tx, clock, id.as_str(), key, value).await?;
    }

    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    Ok(())
}

pub async fn get_snapshot(driver: &SqlDriver, low_memory: bool) -> Result<TreeSnapshot> {
    // One read transaction: the clock and the rows are a consistent view.
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = read_clock_tx(&mut tx).await?;
    let rows: Vec<(String, String, Option<String>)> =
        sqlx::query_as("SELECT nid, rkey, jval FROM nodes WHERE ref_id IS NULL")
            .fetch_all(&mut *tx)
            .await
            .sql_context("Failed to read snapshot rows")?;
    drop(tx);

    let mut grouped: std::collections::HashMap<String, Vec<(String, Value)>> =
        std::collections::HashMap::new();
    for (nid, rkey, jval) in rows {
        let value = match jval {
            Some(text) => decode_value(&text)?,
            None => Value::Null,
        };
        grouped.entry(nid).or_default().push((rkey, value));
    }
    let mut nodes = Vec::with_capacity(grouped.len());
    for (nid, value_rows) in grouped {
        let id = NodeId::new(nid);
        let node = StorageNode::from_value_rows(id.clone(), value_rows).ok_or_else(|| {
            DriverError::Corrupt {
                reason: format!("rows for {id} do not form a node"),
            }
        })?;
        nodes.push(node);
    }
    Ok(TreeSnapshot::from_nodes(clock as u64, nodes, low_memory))
}

pub async fn clock(driver: &SqlDriver) -> Result<u64> {
    let row: Option<(String,)> = sqlx::query_as("SELECT jval FROM meta WHERE mkey = $1")
        .bind(CLOCK_META_KEY)
        .fetch_optional(driver.pool())
        .await
        .sql_context("Failed to read clock")?;
    match row {
        Some((text,)) => text.parse().map_err(|_| {
            DriverError::Corrupt {
                reason: format!("clock row holds non-integer value {text:?}"),
            }
            .into()
        }),
        None => Ok(0),
    }
}

pub async fn delta_since(driver: &SqlDriver, since: u64) -> Result<NodeDelta> {
    // Per (nid, rkey), take the highest-clock version row after `since`.
    let rows: Vec<(String, String, Option<String>, Option<String>)> = sqlx::query_as(
        "SELECT nid, rkey, jval, ref_id FROM (
            SELECT nid, rkey, jval, ref_id,
                   ROW_NUMBER() OVER (PARTITION BY nid, rkey ORDER BY clock DESC) AS rn
            FROM node_versions WHERE clock > $1
         ) ranked WHERE rn = 1",
    )
    .bind(since as i64)
    .fetch_all(driver.pool())
    .await
    .sql_context("Failed to compute delta")?;

    let mut delta = NodeDelta::new();
    for (nid, rkey, jval, ref_id) in rows {
        let nid = NodeId::new(nid);
        match (jval, ref_id) {
            (None, None) => delta.remove_key(&nid, rkey),
            (_, Some(child)) => delta.set_ref(&nid, rkey, NodeId::new(child)),
            (Some(text), None) => delta.set_value(&nid, rkey, decode_value(&text)?),
        }
    }
    Ok(delta)
}

pub async fn full_delta(driver: &SqlDriver) -> Result<NodeDelta> {
    let rows: Vec<(String, String, Option<String>, Option<String>)> =
        sqlx::query_as("SELECT nid, rkey, jval, ref_id FROM nodes")
            .fetch_all(driver.pool())
            .await
            .sql_context("Failed to export tree")?;
    let mut delta = NodeDelta::new();
    for (nid, rkey, jval, ref_id) in rows {
        let nid = NodeId::new(nid);
        match (jval, ref_id) {
            (_, Some(child)) => delta.set_ref(&nid, rkey, NodeId::new(child)),
            (Some(text), None) => delta.set_value(&nid, rkey, decode_value(&text)?),
            (None, None) => {
                return Err(DriverError::Corrupt {
                    reason: format!("current row {nid}/{rkey} has neither value nor ref"),
                }
                .into());
            }
        }
    }
    Ok(delta)
}

pub async fn get_meta(driver: &SqlDriver, key: &str) -> Result<Option<Value>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT jval FROM meta WHERE mkey = $1")
        .bind(key)
        .fetch_optional(driver.pool())
        .await
        .sql_context("Failed to get metadata")?;
    match row {
        Some((text,)) => Ok(Some(decode_value(&text)?)),
        None => Ok(None),
    }
}

pub async fn put_meta(driver: &SqlDriver, key: &str, value: Value) -> Result<()> {
    let text = encode_value(&value)?;
    let sql = if driver.is_sqlite() {
        "INSERT OR REPLACE INTO meta (mkey, jval) VALUES ($1, $2)"
    } else {
        "INSERT INTO meta (mkey, jval) VALUES ($1, $2)
         ON CONFLICT (mkey) DO UPDATE SET jval = EXCLUDED.jval"
    };
    sqlx::query(sql)
        .bind(key)
        .bind(&text)
        .execute(driver.pool())
        .await
        .sql_context("Failed to put metadata")?;
    Ok(())
}

pub async fn delete_meta(driver: &SqlDriver, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM meta WHERE mkey = $1")
        .bind(key)
        .execute(driver.pool())
        .await
        .sql_context("Failed to delete metadata")?;
    Ok(())
}

pub async fn next_actor(driver: &SqlDriver) -> Result<u64> {
    // The UPDATE takes a row lock, so concurrent callers serialize and each
    // sees its own incremented value.
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    sqlx::query("UPDATE actor_counter SET value = value + 1 WHERE id = 0")
        .execute(&mut *tx)
        .await
        .sql_context("Failed to increment actor counter")?;
    let (value,): (i64,) = sqlx::query_as("SELECT value FROM actor_counter WHERE id = 0")
        .fetch_one(&mut *tx)
        .await
        .sql_context("Failed to read actor counter")?;
    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    Ok(value as u64)
}

pub async fn append_ydoc_update(driver: &SqlDriver, doc_id: &str, update: &[u8]) -> Result<()> {
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let (seq,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(seq), 0) + 1 FROM ydoc_updates WHERE doc_id = $1")
            .bind(doc_id)
            .fetch_one(&mut *tx)
            .await
            .sql_context("Failed to allocate update sequence")?;
    sqlx::query("INSERT INTO ydoc_updates (doc_id, seq, update_bytes) VALUES ($1, $2, $3)")
        .bind(doc_id)
        .bind(seq)
        .bind(update.to_vec())
        .execute(&mut *tx)
        .await
        .sql_context("Failed to append yjs update")?;
    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    Ok(())
}

pub async fn get_ydoc_updates(driver: &SqlDriver, doc_id: &str) -> Result<Vec<Vec<u8>>> {
    let rows: Vec<(Vec<u8>,)> =
        sqlx::query_as("SELECT update_bytes FROM ydoc_updates WHERE doc_id = $1 ORDER BY seq")
            .bind(doc_id)
            .fetch_all(driver.pool())
            .await
            .sql_context("Failed to read yjs updates")?;
    Ok(rows.into_iter().map(|(bytes,)| bytes).collect())
}

pub async fn put_session(
    driver: &SqlDriver,
    key: &str,
    value: Value,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    let text = encode_value(&value)?;
    let sql = if driver.is_sqlite() {
        "INSERT OR REPLACE INTO leased_sessions (skey, jval, expires_at) VALUES ($1, $2, $3)"
    } else {
        "INSERT INTO leased_sessions (skey, jval, expires_at) VALUES ($1, $2, $3)
         ON CONFLICT (skey) DO UPDATE SET
            jval = EXCLUDED.jval, expires_at = EXCLUDED.expires_at"
    };
    sqlx::query(sql)
        .bind(key)
        .bind(&text)
        .bind(expires_at.to_rfc3339())
        .execute(driver.pool())
        .await
        .sql_context("Failed to put session")?;
    Ok(())
}

pub async fn get_session(driver: &SqlDriver, key: &str) -> Result<Option<LeasedSession>> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT jval, expires_at FROM leased_sessions WHERE skey = $1")
            .bind(key)
            .fetch_optional(driver.pool())
            .await
            .sql_context("Failed to get session")?;
    match row {
        Some((text, expires)) => {
            let value = decode_value(&text)?;
            let expires_at = DateTime::parse_from_rfc3339(&expires)
                .map_err(|e| DriverError::Corrupt {
                    reason: format!("session {key} has undecodable expiry: {e}"),
                })?
                .with_timezone(&Utc);
            Ok(Some(LeasedSession { value, expires_at }))
        }
        None => Ok(None),
    }
}

pub async fn delete_session(driver: &SqlDriver, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM leased_sessions WHERE skey = $1")
        .bind(key)
        .execute(driver.pool())
        .await
        .sql_context("Failed to delete session")?;
    Ok(())
}

pub async fn reset_nodes(driver: &SqlDriver, nodes: Vec<StorageNode>) -> Result<()> {
    let mut tx = driver
        .pool()
        .begin()
        .await
        .sql_context("Failed to begin transaction")?;
    let clock = allocate_clock_tx(&mut tx).await?;

    sqlx::query("DELETE FROM nodes")
        .execute(&mut *tx)
        .await
        .sql_context("Failed to clear nodes")?;
    sqlx::query("DELETE FROM node_versions")
        .execute(&mut *tx)
        .await
        .sql_context("Failed to clear version log")?;

    let mut has_root = false;
    for node in &nodes {
        has_root |= node.id.is_root();
        insert_node(driver, &mut tx, node, clock).await?;
    }
    if !has_root {
        insert_node(driver, &mut tx, &StorageNode::root(), clock).await?;
    }

    tx.commit()
        .await
        .sql_context("Failed to commit transaction")?;
    debug!(clock, "node tree reset");
    Ok(())
}
