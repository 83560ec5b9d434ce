//! Storage driver conformance tests, run against every backend via the
//! TEST_BACKEND env var.

use chrono::{Duration, Utc};
use livetree::driver::{StorageDriver, with_snapshot};
use livetree::node::{NodeId, ParentLink, StorageNode};
use livetree::pos::Position;
use serde_json::json;

use crate::helpers::{depth_of, put_list, put_map, put_object, put_register, test_driver};

#[tokio::test]
async fn root_exists_and_ignores_deletion() {
    let driver = test_driver().await;
    let root = driver.get_node(&NodeId::root()).await.unwrap();
    assert!(root.parent().is_none());

    driver.delete_node(&NodeId::root()).await.unwrap();
    assert!(driver.has_node(&NodeId::root()).await.unwrap());
    // A no-op deletion does not tick the clock.
    assert_eq!(driver.clock().await.unwrap(), 0);
}

#[tokio::test]
async fn set_child_attaches_and_resolves() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;

    let child = driver
        .get_child_at(&NodeId::root(), "child")
        .await
        .unwrap();
    assert_eq!(child, Some(NodeId::new("o1")));
    assert!(driver.has_child_at(&NodeId::root(), "child").await.unwrap());
    assert_eq!(driver.clock().await.unwrap(), 1);

    // Static fields are not children.
    put_object(driver.as_ref(), "o2", "root", "other", json!({"x": 2})).await;
    assert_eq!(driver.get_child_at(&NodeId::new("o2"), "x").await.unwrap(), None);
}

#[tokio::test]
async fn set_child_validates_and_leaves_no_trace_on_error() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "slot", json!({})).await;
    let clock = driver.clock().await.unwrap();

    // Missing parent.
    let err = driver
        .set_child(
            StorageNode::new_map("m1", ParentLink::new("ghost", "k")),
            false,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // Id collision.
    let err = driver
        .set_child(
            StorageNode::new_map("o1", ParentLink::new("root", "elsewhere")),
            false,
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    // Slot collision.
    let err = driver
        .set_child(
            StorageNode::new_map("m2", ParentLink::new("root", "slot")),
            false,
        )
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    assert_eq!(driver.clock().await.unwrap(), clock);
    assert!(!driver.has_node(&NodeId::new("m1")).await.unwrap());
    assert!(!driver.has_node(&NodeId::new("m2")).await.unwrap());
}

#[tokio::test]
async fn set_child_overwrite_replaces_occupant_subtree() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "slot", json!({})).await;
    put_list(driver.as_ref(), "l1", "o1", "items").await;

    driver
        .set_child(
            StorageNode::new_map("m1", ParentLink::new("root", "slot")),
            true,
        )
        .await
        .unwrap();

    assert_eq!(
        driver.get_child_at(&NodeId::root(), "slot").await.unwrap(),
        Some(NodeId::new("m1"))
    );
    assert!(!driver.has_node(&NodeId::new("o1")).await.unwrap());
    assert!(!driver.has_node(&NodeId::new("l1")).await.unwrap());
}

#[tokio::test]
async fn register_attaches_to_a_container_only() {
    let driver = test_driver().await;
    let pos = Position::first();
    put_list(driver.as_ref(), "l1", "root", "list1").await;
    put_register(driver.as_ref(), "r1", "l1", &pos, json!(0)).await;

    // Registers hold no children.
    let err = driver
        .set_child(
            StorageNode::new_register("r2", ParentLink::new("r1", "x"), json!(1)),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        livetree::Error::Driver(livetree::driver::DriverError::NotAContainer { .. })
    ));
}

#[tokio::test]
async fn next_sibling_follows_byte_order() {
    let driver = test_driver().await;
    put_list(driver.as_ref(), "l1", "root", "list1").await;
    let a = Position::first();
    let b = a.after();
    let c = b.after();
    put_register(driver.as_ref(), "ra", "l1", &a, json!("a")).await;
    put_register(driver.as_ref(), "rc", "l1", &c, json!("c")).await;
    put_register(driver.as_ref(), "rb", "l1", &b, json!("b")).await;

    let next = driver.get_next_sibling(&NodeId::new("l1"), &a).await.unwrap();
    assert_eq!(next, Some(b.clone()));
    let next = driver.get_next_sibling(&NodeId::new("l1"), &b).await.unwrap();
    assert_eq!(next, Some(c.clone()));
    assert_eq!(
        driver.get_next_sibling(&NodeId::new("l1"), &c).await.unwrap(),
        None
    );

    // The probe position need not belong to an existing child.
    let wedged = Position::between(&a, &b).unwrap();
    let next = driver
        .get_next_sibling(&NodeId::new("l1"), &wedged)
        .await
        .unwrap();
    assert_eq!(next, Some(b));
}

#[tokio::test]
async fn move_sibling_repositions_without_renumbering() {
    let driver = test_driver().await;
    put_list(driver.as_ref(), "l1", "root", "list1").await;
    let a = Position::first();
    let b = a.after();
    put_register(driver.as_ref(), "ra", "l1", &a, json!("a")).await;
    put_register(driver.as_ref(), "rb", "l1", &b, json!("b")).await;

    // Occupied target position is a conflict.
    let err = driver.move_sibling(&NodeId::new("ra"), b.clone()).await.unwrap_err();
    assert!(err.is_conflict());

    driver.move_sibling(&NodeId::new("ra"), b.after()).await.unwrap();
    let node = driver.get_node(&NodeId::new("ra")).await.unwrap();
    assert_eq!(node.parent().unwrap().key, b.after().as_str());
    assert_eq!(
        driver.get_child_at(&NodeId::new("l1"), a.as_str()).await.unwrap(),
        None
    );

    // Moving the root is a no-op.
    driver.move_sibling(&NodeId::root(), Position::first()).await.unwrap();
    assert!(driver.get_node(&NodeId::root()).await.unwrap().parent().is_none());
}

#[tokio::test]
async fn delete_node_removes_whole_subtree() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;
    put_map(driver.as_ref(), "m1", "o1", "meta").await;
    put_list(driver.as_ref(), "l1", "m1", "items").await;

    driver.delete_node(&NodeId::new("o1")).await.unwrap();
    for id in ["o1", "m1", "l1"] {
        assert!(!driver.has_node(&NodeId::new(id)).await.unwrap(), "{id} survived");
    }
    assert_eq!(driver.get_child_at(&NodeId::root(), "child").await.unwrap(), None);
    assert_eq!(driver.list_nodes().await.unwrap(), vec![NodeId::root()]);
}

#[tokio::test]
async fn delete_child_key_prefers_the_static_field() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"k": 1})).await;
    put_map(driver.as_ref(), "m1", "o1", "k").await;

    // First deletion takes the static field, leaving the CRDT child.
    driver.delete_child_key(&NodeId::new("o1"), "k").await.unwrap();
    assert!(driver.has_node(&NodeId::new("m1")).await.unwrap());

    // Second deletion takes the child subtree.
    driver.delete_child_key(&NodeId::new("o1"), "k").await.unwrap();
    assert!(!driver.has_node(&NodeId::new("m1")).await.unwrap());

    // Third is a no-op and does not tick the clock.
    let clock = driver.clock().await.unwrap();
    driver.delete_child_key(&NodeId::new("o1"), "k").await.unwrap();
    assert_eq!(driver.clock().await.unwrap(), clock);
}

#[tokio::test]
async fn set_object_data_merges_and_detects_collisions() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;
    put_map(driver.as_ref(), "m1", "o1", "taken").await;

    driver
        .set_object_data(
            &NodeId::new("o1"),
            json!({"b": 2}).as_object().unwrap().clone(),
            false,
        )
        .await
        .unwrap();
    let node = driver.get_node(&NodeId::new("o1")).await.unwrap();
    match &node.crdt {
        livetree::node::CrdtNode::Object { data, .. } => {
            assert_eq!(data.get("a"), Some(&json!(1)));
            assert_eq!(data.get("b"), Some(&json!(2)));
        }
        other => panic!("unexpected node: {other:?}"),
    }

    let err = driver
        .set_object_data(
            &NodeId::new("o1"),
            json!({"taken": 3}).as_object().unwrap().clone(),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        livetree::Error::Driver(livetree::driver::DriverError::ChildKeyCollision { .. })
    ));

    // With overwrite the colliding child subtree is removed.
    driver
        .set_object_data(
            &NodeId::new("o1"),
            json!({"taken": 3}).as_object().unwrap().clone(),
            true,
        )
        .await
        .unwrap();
    assert!(!driver.has_node(&NodeId::new("m1")).await.unwrap());

    // Non-objects reject static data.
    put_list(driver.as_ref(), "l1", "root", "list1").await;
    let err = driver
        .set_object_data(&NodeId::new("l1"), Default::default(), false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        livetree::Error::Driver(livetree::driver::DriverError::NotAnObject { .. })
    ));
}

#[tokio::test]
async fn delta_since_nets_out_intermediate_writes() {
    let driver = test_driver().await;
    let start = driver.clock().await.unwrap();

    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;
    driver
        .set_object_data(
            &NodeId::new("o1"),
            json!({"a": 2}).as_object().unwrap().clone(),
            false,
        )
        .await
        .unwrap();
    put_map(driver.as_ref(), "m1", "o1", "meta").await;
    driver.delete_node(&NodeId::new("m1")).await.unwrap();

    let delta = driver.delta_since(start).await.unwrap();
    // Only the final value of o1.a survives.
    assert_eq!(delta.values[&NodeId::new("o1")]["a"], json!(2));
    assert_eq!(delta.refs[&NodeId::root()]["child"], NodeId::new("o1"));
    // m1 was created and deleted inside the window; the net effect is removal.
    assert!(delta.values.get(&NodeId::new("m1")).is_none());
    assert!(delta.removed.contains_key(&NodeId::new("m1")));

    // A delta from the current clock is empty.
    let now = driver.clock().await.unwrap();
    assert!(driver.delta_since(now).await.unwrap().is_empty());
}

#[tokio::test]
async fn full_delta_reproduces_the_tree() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;
    put_list(driver.as_ref(), "l1", "o1", "items").await;

    let full = driver.full_delta().await.unwrap();
    assert!(full.removed.is_empty());
    assert_eq!(full.refs[&NodeId::root()]["child"], NodeId::new("o1"));
    assert_eq!(full.refs[&NodeId::new("o1")]["items"], NodeId::new("l1"));
    assert_eq!(full.values[&NodeId::new("o1")]["a"], json!(1));
    assert_eq!(full.values[&NodeId::root()]["$kind"], json!("Object"));
}

#[tokio::test]
async fn snapshots_are_isolated_from_later_writes() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({"a": 1})).await;

    let snapshot = driver.get_snapshot(false).await.unwrap();
    let clock = snapshot.clock();

    put_map(driver.as_ref(), "m1", "o1", "meta").await;
    driver.delete_node(&NodeId::new("o1")).await.unwrap();

    assert_eq!(snapshot.clock(), clock);
    assert!(snapshot.get_node(&NodeId::new("o1")).is_some());
    assert!(snapshot.get_node(&NodeId::new("m1")).is_none());
    snapshot.destroy();

    // The scoped helper sees the post-mutation state.
    let len = with_snapshot(driver.as_ref(), true, |snap| Ok(snap.len()))
        .await
        .unwrap();
    assert_eq!(len, 1);
}

#[tokio::test]
async fn parents_stay_acyclic_and_reachable() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "child", json!({})).await;
    put_map(driver.as_ref(), "m1", "o1", "meta").await;
    put_list(driver.as_ref(), "l1", "m1", "items").await;

    for id in ["o1", "m1", "l1"] {
        depth_of(driver.as_ref(), &NodeId::new(id)).await;
    }
}

#[tokio::test]
async fn meta_store_roundtrip() {
    let driver = test_driver().await;
    assert_eq!(driver.get_meta("k").await.unwrap(), None);
    driver.put_meta("k", json!({"a": 1})).await.unwrap();
    driver.put_meta("k", json!([1, 2])).await.unwrap();
    assert_eq!(driver.get_meta("k").await.unwrap(), Some(json!([1, 2])));
    driver.delete_meta("k").await.unwrap();
    assert_eq!(driver.get_meta("k").await.unwrap(), None);
}

#[tokio::test]
async fn concurrent_mutations_commit_at_distinct_ticks() {
    let driver = test_driver().await;
    tokio::join!(
        put_object(driver.as_ref(), "a1", "root", "a", json!({"n": 1})),
        put_object(driver.as_ref(), "b1", "root", "b", json!({"n": 2})),
    );

    // Two mutations take two ticks, whichever order they land in, and each
    // tick carries exactly one of the inserts.
    assert_eq!(driver.clock().await.unwrap(), 2);
    let last = driver.delta_since(1).await.unwrap();
    let inserted: Vec<_> = last.values.keys().cloned().collect();
    assert_eq!(inserted.len(), 1, "one insert per tick, got {inserted:?}");
    assert!(inserted[0] == NodeId::new("a1") || inserted[0] == NodeId::new("b1"));
}

#[tokio::test]
async fn next_actor_never_repeats() {
    let driver = test_driver().await;
    let mut seen = Vec::new();
    for _ in 0..10 {
        let actor = driver.next_actor().await.unwrap();
        assert!(!seen.contains(&actor), "actor {actor} issued twice");
        seen.push(actor);
    }
}

#[tokio::test]
async fn ydoc_updates_keep_append_order() {
    let driver = test_driver().await;
    assert!(driver.get_ydoc_updates("doc1").await.unwrap().is_empty());

    driver.append_ydoc_update("doc1", &[1, 2]).await.unwrap();
    driver.append_ydoc_update("doc1", &[3]).await.unwrap();
    driver.append_ydoc_update("doc2", &[9]).await.unwrap();

    assert_eq!(
        driver.get_ydoc_updates("doc1").await.unwrap(),
        vec![vec![1, 2], vec![3]]
    );
    assert_eq!(driver.get_ydoc_updates("doc2").await.unwrap(), vec![vec![9]]);
}

#[cfg(feature = "y-crdt")]
#[tokio::test]
async fn merged_ydoc_folds_the_update_log() {
    use livetree::driver::merged_ydoc;
    use livetree::y_crdt::updates::decoder::Decode;
    use livetree::y_crdt::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

    let driver = test_driver().await;
    assert_eq!(merged_ydoc(driver.as_ref(), "doc").await.unwrap(), None);

    // One update with the full initial state, one incremental diff.
    let doc = Doc::new();
    let text = doc.get_or_insert_text("body");
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, "hello");
    }
    let first = doc
        .transact()
        .encode_state_as_update_v1(&StateVector::default());
    let seen = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 5, " world");
    }
    let second = doc.transact().encode_diff_v1(&seen);

    driver.append_ydoc_update("doc", &first).await.unwrap();
    driver.append_ydoc_update("doc", &second).await.unwrap();

    let merged = merged_ydoc(driver.as_ref(), "doc").await.unwrap().unwrap();
    let replica = Doc::new();
    let body = replica.get_or_insert_text("body");
    replica
        .transact_mut()
        .apply_update(Update::decode_v1(&merged).unwrap())
        .unwrap();
    assert_eq!(body.get_string(&replica.transact()), "hello world");

    // Garbage in the log surfaces as corruption, per document.
    driver.append_ydoc_update("junk", b"not yjs").await.unwrap();
    let err = merged_ydoc(driver.as_ref(), "junk").await.unwrap_err();
    assert!(matches!(
        err,
        livetree::Error::Driver(livetree::driver::DriverError::Corrupt { .. })
    ));
}

#[tokio::test]
async fn leased_sessions_roundtrip() {
    let driver = test_driver().await;
    let expires = Utc::now() + Duration::minutes(5);
    driver
        .put_session("s1", json!({"actor": 4}), expires)
        .await
        .unwrap();

    let session = driver.get_session("s1").await.unwrap().unwrap();
    assert_eq!(session.value, json!({"actor": 4}));
    assert_eq!(session.expires_at.timestamp(), expires.timestamp());

    driver.delete_session("s1").await.unwrap();
    assert_eq!(driver.get_session("s1").await.unwrap(), None);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_file_persists_across_reopen() {
    use livetree::driver::SqlDriver;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.db");

    {
        let driver = SqlDriver::open_sqlite(&path).await.unwrap();
        put_object(&driver, "o1", "root", "child", json!({"a": 1})).await;
        driver.pool().close().await;
    }

    let driver = SqlDriver::open_sqlite(&path).await.unwrap();
    assert!(driver.has_node(&NodeId::new("o1")).await.unwrap());
    assert_eq!(driver.clock().await.unwrap(), 1);
    driver.pool().close().await;
}

#[tokio::test]
async fn reset_nodes_replaces_the_tree() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "old", "root", "child", json!({})).await;
    let clock = driver.clock().await.unwrap();

    driver
        .reset_nodes(vec![StorageNode::new_map(
            "fresh",
            ParentLink::new("root", "fresh"),
        )])
        .await
        .unwrap();

    assert!(driver.clock().await.unwrap() > clock);
    assert!(!driver.has_node(&NodeId::new("old")).await.unwrap());
    assert!(driver.has_node(&NodeId::new("fresh")).await.unwrap());
    // The root is synthesized even when absent from the replacement set.
    assert!(driver.has_node(&NodeId::root()).await.unwrap());
}
