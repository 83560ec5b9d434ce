//! Shared test factories and tree-building helpers.
//!
//! These are the foundation for all test setup. They provide a single point
//! of change for backend matrix testing via the TEST_BACKEND env var.

use livetree::driver::StorageDriver;
use livetree::node::{JsonObject, NodeId, ParentLink, StorageNode};
use livetree::pos::Position;
use serde_json::Value;

/// Creates a test driver based on the TEST_BACKEND env var.
///
/// Supported values:
/// - "memory" or unset: in-memory driver (default)
/// - "sqlite": SQLite in-memory driver (requires the `sqlite` feature)
/// - "postgres": PostgreSQL driver (requires the `postgres` feature and
///   TEST_POSTGRES_URL)
///
/// # Panics
/// Panics if TEST_BACKEND selects a backend whose feature is not enabled.
///
/// # Example
/// ```bash
/// # Run tests with the in-memory driver (default)
/// cargo test
///
/// # Run tests with SQLite
/// TEST_BACKEND=sqlite cargo test --features sqlite
///
/// # Run tests with PostgreSQL
/// TEST_BACKEND=postgres TEST_POSTGRES_URL="postgres://localhost/livetree_test" \
///   cargo test --features postgres
/// ```
pub async fn test_driver() -> Box<dyn StorageDriver> {
    match std::env::var("TEST_BACKEND").as_deref() {
        Ok("sqlite") => {
            #[cfg(feature = "sqlite")]
            {
                use livetree::driver::SqlDriver;
                Box::new(
                    SqlDriver::sqlite_in_memory()
                        .await
                        .expect("Failed to create SQLite driver"),
                )
            }
            #[cfg(not(feature = "sqlite"))]
            {
                panic!("TEST_BACKEND=sqlite requires the 'sqlite' feature to be enabled")
            }
        }
        Ok("postgres") => {
            #[cfg(feature = "postgres")]
            {
                use livetree::driver::SqlDriver;
                let url = std::env::var("TEST_POSTGRES_URL")
                    .unwrap_or_else(|_| "postgres://localhost/livetree_test".to_string());
                Box::new(
                    SqlDriver::connect_postgres_isolated(&url)
                        .await
                        .expect("Failed to connect to PostgreSQL"),
                )
            }
            #[cfg(not(feature = "postgres"))]
            {
                panic!("TEST_BACKEND=postgres requires the 'postgres' feature to be enabled")
            }
        }
        _ => Box::new(livetree::driver::InMemoryDriver::new()),
    }
}

/// Attaches a non-root OBJECT node with the given static fields.
pub async fn put_object(
    driver: &dyn StorageDriver,
    id: &str,
    parent: &str,
    key: &str,
    data: Value,
) {
    let data: JsonObject = data.as_object().cloned().unwrap_or_default();
    driver
        .set_child(
            StorageNode::new_object(id, ParentLink::new(parent, key), data),
            false,
        )
        .await
        .expect("set_child(object) failed");
}

/// Attaches a LIST node.
pub async fn put_list(driver: &dyn StorageDriver, id: &str, parent: &str, key: &str) {
    driver
        .set_child(StorageNode::new_list(id, ParentLink::new(parent, key)), false)
        .await
        .expect("set_child(list) failed");
}

/// Attaches a MAP node.
pub async fn put_map(driver: &dyn StorageDriver, id: &str, parent: &str, key: &str) {
    driver
        .set_child(StorageNode::new_map(id, ParentLink::new(parent, key)), false)
        .await
        .expect("set_child(map) failed");
}

/// Attaches a REGISTER node at the given list position.
pub async fn put_register(
    driver: &dyn StorageDriver,
    id: &str,
    parent: &str,
    pos: &Position,
    value: Value,
) {
    driver
        .set_child(
            StorageNode::new_register(id, ParentLink::new(parent, pos.as_str()), value),
            false,
        )
        .await
        .expect("set_child(register) failed");
}

/// Walks parent links from `id` up to the root, panicking on a cycle or a
/// missing ancestor. Returns the path length.
pub async fn depth_of(driver: &dyn StorageDriver, id: &NodeId) -> usize {
    let mut seen = vec![id.clone()];
    let mut current = id.clone();
    loop {
        if current.is_root() {
            return seen.len();
        }
        let node = driver.get_node(&current).await.expect("ancestor vanished");
        let parent = node.parent().expect("non-root node without parent").node_id.clone();
        assert!(!seen.contains(&parent), "parent cycle through {parent}");
        seen.push(parent.clone());
        current = parent;
    }
}
