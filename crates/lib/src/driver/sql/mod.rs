//! Versioned SQL storage driver.
//!
//! The reference [`StorageDriver`] implementation: current tree state in the
//! `nodes` table (one row per node/key), a full append-only version log in
//! `node_versions` (one row per write at each clock tick), plus metadata,
//! Yjs updates, leased sessions, and the actor counter.
//!
//! ## Available Backends
//!
//! - **SQLite** (feature: `sqlite`): Embedded database
//! - **PostgreSQL** (feature: `postgres`): PostgreSQL database
//!
//! ## Architecture
//!
//! The driver uses sqlx with `AnyPool` for multi-database support. Every
//! mutation runs inside a database transaction: the pending clock is
//! `committed + 1` while the transaction is open and only durably advances
//! on commit, so a failed mutation rolls back wholesale and no partial
//! writes are ever observable.
//!
//! ## Schema and Migrations
//!
//! The database schema is defined in the [`schema`] module and automatically
//! initialized when connecting. Migrations are handled via code-based
//! functions rather than SQL files to support dialect differences between
//! SQLite and PostgreSQL.

mod storage;

/// Schema definition and migration system.
pub mod schema;

use std::any::Any;
#[cfg(feature = "postgres")]
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::AnyPool;
#[cfg(feature = "postgres")]
use sqlx::Executor;
use sqlx::any::AnyPoolOptions;

use crate::Result;
use crate::delta::NodeDelta;
use crate::driver::errors::DriverError;
use crate::driver::snapshot::TreeSnapshot;
use crate::driver::{LeasedSession, StorageDriver};
use crate::node::{JsonObject, NodeId, StorageNode};
use crate::pos::Position;

/// Extension trait for sqlx Result types to simplify error handling.
///
/// Similar to `anyhow::Context`, this trait adds a method to convert sqlx
/// errors to `DriverError::SqlxError` with a context message.
pub(crate) trait SqlxResultExt<T> {
    /// Convert sqlx error to DriverError with context message.
    fn sql_context(self, context: &str) -> Result<T>;
}

impl<T> SqlxResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T> {
        self.map_err(|e| {
            DriverError::SqlxError {
                reason: format!("{context}: {e}"),
                source: Some(e),
            }
            .into()
        })
    }
}

/// Database backend kind for SQL dialect selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    /// SQLite database
    Sqlite,
    /// PostgreSQL database
    Postgres,
}

/// SQL-backed storage driver over sqlx's `AnyPool`.
///
/// # Thread Safety
///
/// `SqlDriver` is `Send + Sync` as required by [`StorageDriver`]. The
/// underlying sqlx pool handles connection pooling and thread safety.
///
/// # Test Isolation
///
/// For PostgreSQL, each driver instance can use its own schema for test
/// isolation. Use `connect_postgres_isolated()` to create an isolated driver
/// for testing.
pub struct SqlDriver {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlDriver {
    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Get the database kind.
    pub fn kind(&self) -> DbKind {
        self.kind
    }

    /// Check if this driver is using SQLite.
    pub fn is_sqlite(&self) -> bool {
        self.kind == DbKind::Sqlite
    }

    /// Check if this driver is using PostgreSQL.
    pub fn is_postgres(&self) -> bool {
        self.kind == DbKind::Postgres
    }
}

// SQLite-specific implementations
#[cfg(feature = "sqlite")]
impl SqlDriver {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the database file and schema if they don't exist.
    pub async fn open_sqlite<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        // mode=rwc: read-write-create (create file if it doesn't exist)
        let url = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        Self::connect_sqlite(&url).await
    }

    /// Connect to a SQLite database using a connection URL.
    ///
    /// # Arguments
    ///
    /// * `url` - SQLite connection URL (e.g., "sqlite:./my.db")
    pub async fn connect_sqlite(url: &str) -> Result<Self> {
        // Install any driver support
        sqlx::any::install_default_drivers();

        // Detect if this is an in-memory database
        let is_in_memory = url.contains("mode=memory");

        // For SQLite in-memory databases with shared cache, we must prevent
        // all connections from being closed. When the last connection closes,
        // the in-memory database is destroyed and all data is lost.
        let pool = if is_in_memory {
            AnyPoolOptions::new()
                .max_connections(5)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await
                .sql_context("Failed to connect to SQLite")?
        } else {
            AnyPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .sql_context("Failed to connect to SQLite")?
        };

        // Configure SQLite pragmas
        if is_in_memory {
            // In-memory databases don't need WAL mode (all in RAM)
            sqlx::query("PRAGMA busy_timeout = 5000;")
                .execute(&pool)
                .await
                .sql_context("Failed to configure SQLite")?;
        } else {
            // File-based SQLite:
            // - journal_mode=WAL: Write-Ahead Logging for better concurrency
            // - synchronous=NORMAL: Balanced durability (safe with WAL)
            // - busy_timeout=5000: Wait up to 5s for locks before failing
            sqlx::query(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
            .execute(&pool)
            .await
            .sql_context("Failed to configure SQLite")?;
        }

        let driver = Self {
            pool,
            kind: DbKind::Sqlite,
        };

        // Initialize schema
        schema::initialize(&driver).await?;

        Ok(driver)
    }

    /// Create an in-memory SQLite database.
    ///
    /// The database exists only for the lifetime of this driver instance.
    /// Useful for testing.
    pub async fn sqlite_in_memory() -> Result<Self> {
        // Use shared cache mode for in-memory SQLite so all connections in
        // the pool share the same database. Without this, each connection
        // gets its own isolated in-memory database.
        // Use a unique name per instance to avoid sharing between tests.
        let unique_id = uuid::Uuid::new_v4();
        let url = format!("sqlite:file:mem_{unique_id}?mode=memory&cache=shared");
        Self::connect_sqlite(&url).await
    }
}

// PostgreSQL-specific implementations
#[cfg(feature = "postgres")]
impl SqlDriver {
    /// Connect to a PostgreSQL database using a connection URL.
    ///
    /// This connects to the default (public) schema. For test isolation,
    /// use `connect_postgres_isolated()` instead.
    pub async fn connect_postgres(url: &str) -> Result<Self> {
        Self::connect_postgres_with_schema(url, None).await
    }

    /// Connect to a PostgreSQL database with a specific schema for isolation.
    ///
    /// Creates a unique schema if `schema_name` is provided, so parallel
    /// tests don't interfere with each other.
    async fn connect_postgres_with_schema(url: &str, schema_name: Option<String>) -> Result<Self> {
        // Install any driver support
        sqlx::any::install_default_drivers();

        // If schema_name is provided, first create the schema, then use
        // after_connect to set search_path on each connection. This is more
        // reliable than URL options which don't work consistently across all
        // network configurations.
        if let Some(ref schema) = schema_name {
            let temp_pool = AnyPoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
                .sql_context("Failed to connect to PostgreSQL")?;

            let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {schema}");
            sqlx::query(&create_schema)
                .execute(&temp_pool)
                .await
                .sql_context(&format!("Failed to create schema {schema}"))?;

            temp_pool.close().await;
        }

        // Build pool with after_connect hook to set search_path on each
        // connection. For isolated (test) connections, use a smaller pool to
        // avoid exhausting PostgreSQL's max_connections when running many
        // tests in parallel.
        let schema_for_hook = schema_name.clone();
        let is_isolated = schema_name.is_some();
        let mut pool_options = AnyPoolOptions::new();

        if is_isolated {
            pool_options = pool_options
                .max_connections(2)
                .acquire_timeout(Duration::from_secs(30));
        } else {
            pool_options = pool_options.max_connections(5);
        }

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                let schema = schema_for_hook.clone();
                Box::pin(async move {
                    if let Some(ref s) = schema {
                        let set_path = format!("SET search_path TO {s}");
                        conn.execute(set_path.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(url)
            .await
            .sql_context("Failed to connect to PostgreSQL")?;

        let driver = Self {
            pool,
            kind: DbKind::Postgres,
        };

        // Initialize schema (tables will be created in the current search_path)
        schema::initialize(&driver).await?;

        Ok(driver)
    }

    /// Connect to a PostgreSQL database with test isolation.
    ///
    /// Creates a unique schema for this driver instance, ensuring tests
    /// don't interfere with each other when run in parallel.
    pub async fn connect_postgres_isolated(url: &str) -> Result<Self> {
        // PostgreSQL schema names must start with a letter and be lowercase
        let unique_id = uuid::Uuid::new_v4().simple().to_string();
        let schema_name = format!("test_{unique_id}");
        Self::connect_postgres_with_schema(url, Some(schema_name)).await
    }
}

#[async_trait]
impl StorageDriver for SqlDriver {
    async fn get_node(&self, id: &NodeId) -> Result<StorageNode> {
        storage::get_node(self, id).await
    }

    async fn has_node(&self, id: &NodeId) -> Result<bool> {
        storage::has_node(self, id).await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeId>> {
        storage::list_nodes(self).await
    }

    async fn get_child_at(&self, parent: &NodeId, key: &str) -> Result<Option<NodeId>> {
        storage::get_child_at(self, parent, key).await
    }

    async fn get_next_sibling(&self, parent: &NodeId, pos: &Position) -> Result<Option<Position>> {
        storage::get_next_sibling(self, parent, pos).await
    }

    async fn set_child(&self, node: StorageNode, allow_overwrite: bool) -> Result<()> {
        storage::set_child(self, node, allow_overwrite).await
    }

    async fn move_sibling(&self, id: &NodeId, new_pos: Position) -> Result<()> {
        storage::move_sibling(self, id, new_pos).await
    }

    async fn delete_node(&self, id: &NodeId) -> Result<()> {
        storage::delete_node(self, id).await
    }

    async fn delete_child_key(&self, id: &NodeId, key: &str) -> Result<()> {
        storage::delete_child_key(self, id, key).await
    }

    async fn set_object_data(
        &self,
        id: &NodeId,
        data: JsonObject,
        allow_overwrite: bool,
    ) -> Result<()> {
        storage::set_object_data(self, id, data, allow_overwrite).await
    }

    async fn get_snapshot(&self, low_memory: bool) -> Result<TreeSnapshot> {
        storage::get_snapshot(self, low_memory).await
    }

    async fn clock(&self) -> Result<u64> {
        storage::clock(self).await
    }

    async fn delta_since(&self, since: u64) -> Result<NodeDelta> {
        storage::delta_since(self, since).await
    }

    async fn full_delta(&self) -> Result<NodeDelta> {
        storage::full_delta(self).await
    }

    async fn get_meta(&self, key: &str) -> Result<Option<Value>> {
        storage::get_meta(self, key).await
    }

    async fn put_meta(&self, key: &str, value: Value) -> Result<()> {
        storage::put_meta(self, key, value).await
    }

    async fn delete_meta(&self, key: &str) -> Result<()> {
        storage::delete_meta(self, key).await
    }

    async fn next_actor(&self) -> Result<u64> {
        storage::next_actor(self).await
    }

    async fn append_ydoc_update(&self, doc_id: &str, update: &[u8]) -> Result<()> {
        storage::append_ydoc_update(self, doc_id, update).await
    }

    async fn get_ydoc_updates(&self, doc_id: &str) -> Result<Vec<Vec<u8>>> {
        storage::get_ydoc_updates(self, doc_id).await
    }

    async fn put_session(&self, key: &str, value: Value, expires_at: DateTime<Utc>) -> Result<()> {
        storage::put_session(self, key, value, expires_at).await
    }

    async fn get_session(&self, key: &str) -> Result<Option<LeasedSession>> {
        storage::get_session(self, key).await
    }

    async fn delete_session(&self, key: &str) -> Result<()> {
        storage::delete_session(self, key).await
    }

    async fn reset_nodes(&self, nodes: Vec<StorageNode>) -> Result<()> {
        storage::reset_nodes(self, nodes).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(feature = "sqlite")]
/// Convenience type alias for the SQLite driver.
pub type Sqlite = SqlDriver;

#[cfg(feature = "postgres")]
/// Convenience type alias for the PostgreSQL driver.
pub type Postgres = SqlDriver;
