//! SQL schema definitions and migrations.
//!
//! The schema is designed to be portable between SQLite and Postgres.
//!
//! # Migration System
//!
//! The migration system uses code-based migrations rather than SQL files to
//! handle dialect differences between SQLite and PostgreSQL. Each migration
//! is a function that receives the driver and can execute database-specific
//! SQL as needed.
//!
//! ## Adding a New Migration
//!
//! 1. Increment `SCHEMA_VERSION`
//! 2. Add a new `migrate_vN_to_vM` async function
//! 3. Add the migration to the match statement in `run_migration`
//! 4. Document what the migration does

use crate::Result;
use crate::constants::{CLOCK_META_KEY, ROOT_ID};
use crate::driver::errors::DriverError;
use crate::node::StorageNode;

use super::SqlDriver;

/// Current schema version.
///
/// Increment this when making schema changes that require migration.
pub const SCHEMA_VERSION: i64 = 1;

/// SQL statements to create the schema tables.
///
/// Each statement uses portable SQL that works on both SQLite and PostgreSQL.
pub const CREATE_TABLES: &[&str] = &[
    // Schema version tracking
    // BIGINT (64-bit) used for portability between SQLite and PostgreSQL
    "CREATE TABLE IF NOT EXISTS schema_version (
        version BIGINT PRIMARY KEY
    )",
    // Current tree state, one row per (node, key).
    // jval holds JSON text for value rows; ref_id holds the child node id
    // for child-slot rows. Exactly one of the two is non-null per row.
    "CREATE TABLE IF NOT EXISTS nodes (
        nid TEXT NOT NULL,
        rkey TEXT NOT NULL,
        jval TEXT,
        ref_id TEXT,
        PRIMARY KEY (nid, rkey)
    )",
    // Append-only version log, one row per write at each clock tick.
    // A row with both jval and ref_id null records a removal.
    "CREATE TABLE IF NOT EXISTS node_versions (
        nid TEXT NOT NULL,
        rkey TEXT NOT NULL,
        clock BIGINT NOT NULL,
        jval TEXT,
        ref_id TEXT,
        PRIMARY KEY (nid, rkey, clock)
    )",
    // Metadata key/value store; also holds the committed clock
    "CREATE TABLE IF NOT EXISTS meta (
        mkey TEXT PRIMARY KEY NOT NULL,
        jval TEXT NOT NULL
    )",
    // Yjs binary update log per document
    // BYTEA is PostgreSQL binary type and SQLite maps it to BLOB affinity
    "CREATE TABLE IF NOT EXISTS ydoc_updates (
        doc_id TEXT NOT NULL,
        seq BIGINT NOT NULL,
        update_bytes BYTEA NOT NULL,
        PRIMARY KEY (doc_id, seq)
    )",
    // Leased sessions; expiry is stored, enforcement is the caller's
    "CREATE TABLE IF NOT EXISTS leased_sessions (
        skey TEXT PRIMARY KEY NOT NULL,
        jval TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )",
    // Single-row actor id allocator, incremented transactionally
    "CREATE TABLE IF NOT EXISTS actor_counter (
        id BIGINT PRIMARY KEY,
        value BIGINT NOT NULL
    )",
];

/// SQL statements to create indexes.
pub const CREATE_INDEXES: &[&str] = &[
    // Reverse child-slot lookups (which slot points at a node)
    "CREATE INDEX IF NOT EXISTS idx_nodes_ref ON nodes(ref_id)",
    // Delta computation scans by clock
    "CREATE INDEX IF NOT EXISTS idx_node_versions_clock ON node_versions(clock)",
];

/// Initialize the database schema.
///
/// Creates tables and indexes if they don't exist, seeds the singleton rows
/// (clock, actor counter), and handles migrations if the schema version has
/// changed.
pub async fn initialize(driver: &SqlDriver) -> Result<()> {
    let pool = driver.pool();

    // Create tables
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DriverError::SqlxError {
                reason: format!("Schema creation failed: {e} - SQL: {statement}"),
                source: Some(e),
            })?;
    }

    // Check current schema version
    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_optional(pool)
        .await
        .map_err(|e| DriverError::SqlxError {
            reason: format!("Failed to check schema version: {e}"),
            source: Some(e),
        })?;

    if row.is_none() {
        // First initialization
        sqlx::query("INSERT INTO schema_version (version) VALUES ($1)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await
            .map_err(|e| DriverError::SqlxError {
                reason: format!("Failed to initialize schema version: {e}"),
                source: Some(e),
            })?;
    } else if let Some((current_version,)) = row
        && current_version < SCHEMA_VERSION
    {
        // Run migrations
        migrate(driver, current_version, SCHEMA_VERSION).await?;
    }

    // Create indexes
    for statement in CREATE_INDEXES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| DriverError::SqlxError {
                reason: format!("Index creation failed: {e} - SQL: {statement}"),
                source: Some(e),
            })?;
    }

    // Seed the actor counter
    let seed = if driver.is_sqlite() {
        "INSERT OR IGNORE INTO actor_counter (id, value) VALUES (0, 0)"
    } else {
        "INSERT INTO actor_counter (id, value) VALUES (0, 0) ON CONFLICT DO NOTHING"
    };
    sqlx::query(seed)
        .execute(pool)
        .await
        .map_err(|e| DriverError::SqlxError {
            reason: format!("Failed to seed actor counter: {e}"),
            source: Some(e),
        })?;

    // Seed the clock row; mutations allocate ticks by locking it with an
    // UPDATE, so it must always exist.
    let seed = if driver.is_sqlite() {
        "INSERT OR IGNORE INTO meta (mkey, jval) VALUES ($1, '0')"
    } else {
        "INSERT INTO meta (mkey, jval) VALUES ($1, '0') ON CONFLICT DO NOTHING"
    };
    sqlx::query(seed)
        .bind(CLOCK_META_KEY)
        .execute(pool)
        .await
        .map_err(|e| DriverError::SqlxError {
            reason: format!("Failed to seed clock row: {e}"),
            source: Some(e),
        })?;

    // Seed the immortal root node on first initialization
    let (root_rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM nodes WHERE nid = $1")
        .bind(ROOT_ID)
        .fetch_one(pool)
        .await
        .map_err(|e| DriverError::SqlxError {
            reason: format!("Failed to check for root node: {e}"),
            source: Some(e),
        })?;
    if root_rows == 0 {
        for (rkey, value) in StorageNode::root().value_rows() {
            let text =
                serde_json::to_string(&value).map_err(|e| DriverError::SerializationFailed {
                    source: e,
                })?;
            sqlx::query("INSERT INTO nodes (nid, rkey, jval, ref_id) VALUES ($1, $2, $3, NULL)")
                .bind(ROOT_ID)
                .bind(&rkey)
                .bind(&text)
                .execute(pool)
                .await
                .map_err(|e| DriverError::SqlxError {
                    reason: format!("Failed to seed root node: {e}"),
                    source: Some(e),
                })?;
        }
    }

    Ok(())
}

/// Run migrations sequentially from one schema version to another.
///
/// Migrations are run one at a time, incrementing the version after each.
/// This allows for proper error handling and rollback semantics.
async fn migrate(driver: &SqlDriver, from: i64, to: i64) -> Result<()> {
    tracing::info!(from, to, "Starting SQL schema migration");

    let mut current = from;
    while current < to {
        let next = current + 1;
        tracing::info!(from = current, to = next, "Running migration");

        run_migration(driver, current, next).await?;

        // Update schema version after successful migration
        sqlx::query("UPDATE schema_version SET version = $1")
            .bind(next)
            .execute(driver.pool())
            .await
            .map_err(|e| DriverError::SqlxError {
                reason: format!("Failed to update schema version to {next}: {e}"),
                source: Some(e),
            })?;

        tracing::info!(version = next, "Migration completed");
        current = next;
    }

    tracing::info!(from, to, "All migrations completed successfully");
    Ok(())
}

/// Execute a single migration step.
///
/// Each migration is a separate async function that handles the schema
/// change. Add new migrations here as match arms.
async fn run_migration(driver: &SqlDriver, from: i64, to: i64) -> Result<()> {
    // When adding the first migration, replace this with:
    //
    // match from {
    //     1 => migrate_v1_to_v2(driver).await,
    //     _ => Err(DriverError::SqlxError { ... }.into()),
    // }
    //
    // For now, since there are no migrations yet, any attempt to migrate is
    // an error.

    // Suppress unused variable warning until migrations are added
    let _ = driver;

    Err(DriverError::SqlxError {
        reason: format!(
            "Unknown migration path: v{from} to v{to}. \
             This likely means SCHEMA_VERSION was incremented without adding a migration."
        ),
        source: None,
    }
    .into())
}
