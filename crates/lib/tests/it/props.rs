//! Property tests: position ordering, delta idempotence, projection
//! equivalence, and tree consistency under random op sequences.

use livetree::driver::{InMemoryDriver, StorageDriver};
use livetree::node::{JsonObject, NodeId};
use livetree::pos::Position;
use livetree::protocol::ClientWireOp;
use livetree::serialize::{JsonChunks, to_lossy_json, to_plain_lson};
use livetree::server::apply_op;
use livetree::LayeredCache;
use proptest::prelude::*;
use serde_json::Value;

fn arb_json() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn arb_data() -> impl Strategy<Value = JsonObject> {
    prop::collection::btree_map("[a-z]{1,3}", arb_json(), 0..3)
        .prop_map(|m| m.into_iter().collect())
}

fn arb_node_id() -> impl Strategy<Value = NodeId> {
    (0..8u8).prop_map(|n| NodeId::new(format!("n{n}")))
}

fn arb_parent_id() -> impl Strategy<Value = NodeId> {
    prop_oneof![Just(NodeId::root()), arb_node_id()]
}

fn arb_key() -> impl Strategy<Value = String> {
    (0..4u8).prop_map(|n| format!("k{n}"))
}

/// Random wire ops over a small id space, so sequences regularly hit
/// collisions, overwrites, and missing targets.
fn arb_wire_op() -> impl Strategy<Value = ClientWireOp> {
    prop_oneof![
        (arb_node_id(), arb_parent_id(), arb_key(), arb_data()).prop_map(
            |(id, parent_id, parent_key, data)| ClientWireOp::CreateObject {
                id,
                parent_id,
                parent_key,
                data,
            }
        ),
        (arb_node_id(), arb_parent_id(), arb_key()).prop_map(|(id, parent_id, parent_key)| {
            ClientWireOp::CreateList {
                id,
                parent_id,
                parent_key,
            }
        }),
        (arb_node_id(), arb_parent_id(), arb_key()).prop_map(|(id, parent_id, parent_key)| {
            ClientWireOp::CreateMap {
                id,
                parent_id,
                parent_key,
            }
        }),
        (arb_node_id(), arb_parent_id(), arb_key(), arb_json()).prop_map(
            |(id, parent_id, parent_key, data)| ClientWireOp::CreateRegister {
                id,
                parent_id,
                parent_key,
                data,
            }
        ),
        arb_node_id().prop_map(|id| ClientWireOp::DeleteCrdt { id }),
        (arb_node_id(), arb_key()).prop_map(|(id, key)| ClientWireOp::SetParentKey {
            id,
            new_pos: Position::from(key.as_str()),
        }),
        (arb_node_id(), arb_data())
            .prop_map(|(id, data)| ClientWireOp::UpdateObject { id, data }),
        (arb_node_id(), arb_key()).prop_map(|(id, key)| ClientWireOp::DeleteObjectKey { id, key }),
    ]
}

fn block_on<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(fut)
}

/// Every non-root node must have a live parent whose slot points back at
/// it, and walking parent links must reach the root without cycles.
async fn assert_tree_consistent(driver: &InMemoryDriver) {
    let ids = driver.list_nodes().await.unwrap();
    let count = ids.len();
    for id in ids {
        if id.is_root() {
            assert!(driver.get_node(&id).await.unwrap().parent().is_none());
            continue;
        }
        let node = driver.get_node(&id).await.unwrap();
        let link = node.parent().expect("non-root node without parent").clone();
        assert!(
            driver.has_node(&link.node_id).await.unwrap(),
            "{id} has dangling parent {}",
            link.node_id
        );
        assert_eq!(
            driver.get_child_at(&link.node_id, &link.key).await.unwrap(),
            Some(id.clone()),
            "slot ({}, {}) does not point back at {id}",
            link.node_id,
            link.key
        );

        let mut hops = 0;
        let mut cursor = id.clone();
        while !cursor.is_root() {
            cursor = driver
                .get_node(&cursor)
                .await
                .unwrap()
                .parent()
                .unwrap()
                .node_id
                .clone();
            hops += 1;
            assert!(hops <= count, "parent cycle through {id}");
        }
    }
}

proptest! {
    /// Positions generated by `after` and `between` stay strictly ordered
    /// no matter where insertion happens.
    #[test]
    fn positions_stay_strictly_ordered(
        picks in prop::collection::vec(any::<prop::sample::Index>(), 1..60)
    ) {
        let mut ordered = vec![Position::first()];
        for pick in picks {
            let i = pick.index(ordered.len());
            let fresh = if i + 1 == ordered.len() {
                ordered[i].after()
            } else {
                Position::between(&ordered[i], &ordered[i + 1])
                    .expect("between on adjacent ordered positions")
            };
            prop_assert!(ordered[i] < fresh);
            if i + 1 < ordered.len() {
                prop_assert!(fresh < ordered[i + 1]);
            }
            ordered.insert(i + 1, fresh);
        }
        for pair in ordered.windows(2) {
            prop_assert!(pair[0] < pair[1]);
        }
    }

    /// Actor suffixes break ties without breaking order.
    #[test]
    fn actor_suffixes_preserve_distinctness(base in "[1-9A-Za-z]{1,6}", a in any::<u64>(), b in any::<u64>()) {
        let pos = Position::from(base.as_str());
        let pa = pos.with_actor(a);
        let pb = pos.with_actor(b);
        if a != b {
            prop_assert_ne!(&pa, &pb);
        }
        // Suffixing is deterministic.
        prop_assert_eq!(pa, pos.with_actor(a));
        prop_assert_eq!(pb, pos.with_actor(b));
    }

    /// Applying the same wire delta twice leaves the cache exactly where
    /// one application left it.
    #[test]
    fn delta_application_is_idempotent(
        base in prop::collection::btree_map("[a-z]{1,3}", arb_json(), 0..6),
        deleted in prop::collection::vec("[a-z]{1,3}", 0..4),
        updated in prop::collection::vec(("[a-z]{1,3}", arb_json()), 0..6),
    ) {
        let mut cache = LayeredCache::new();
        for (key, value) in base {
            cache.set(key, value);
        }

        let apply = |cache: &mut LayeredCache| {
            for key in &deleted {
                cache.delete(key);
            }
            for (key, value) in &updated {
                cache.set(key.clone(), value.clone());
            }
        };

        apply(&mut cache);
        let once = cache.to_json();
        apply(&mut cache);
        prop_assert_eq!(cache.to_json(), once);
    }

    /// Random op sequences never corrupt the tree: failed ops leave no
    /// trace, successful ones keep every node reachable and acyclic, and
    /// both projections agree on the result.
    #[test]
    fn random_ops_keep_the_tree_consistent(
        ops in prop::collection::vec(arb_wire_op(), 1..40)
    ) {
        block_on(async {
            let driver = InMemoryDriver::new();
            for op in &ops {
                // Precondition failures are expected; corruption is not.
                let _ = apply_op(&driver, op).await;
            }
            assert_tree_consistent(&driver).await;

            for low_memory in [false, true] {
                let snapshot = driver.get_snapshot(low_memory).await.unwrap();
                let eager = serde_json::to_string(&to_plain_lson(&snapshot).unwrap()).unwrap();
                let lazy = JsonChunks::plain_lson(&snapshot).collect_string().unwrap();
                assert_eq!(eager, lazy);

                let eager = serde_json::to_string(&to_lossy_json(&snapshot).unwrap()).unwrap();
                let lazy = JsonChunks::lossy_json(&snapshot).collect_string().unwrap();
                assert_eq!(eager, lazy);
                snapshot.destroy();
            }
        });
    }

    /// Replaying the delta log from any point reproduces the current tree:
    /// a fresh full delta equals the net of everything ever written.
    #[test]
    fn delta_since_zero_equals_full_delta(
        ops in prop::collection::vec(arb_wire_op(), 1..30)
    ) {
        block_on(async {
            let driver = InMemoryDriver::new();
            for op in &ops {
                let _ = apply_op(&driver, op).await;
            }

            let log = driver.delta_since(0).await.unwrap();
            let full = driver.full_delta().await.unwrap();

            // Every net write in the log must still be the current state.
            for (nid, values) in &log.values {
                for (key, value) in values {
                    assert_eq!(
                        full.values.get(nid).and_then(|m| m.get(key)),
                        Some(value),
                        "logged value ({nid}, {key}) diverges from the tree"
                    );
                }
            }
            for (nid, refs) in &log.refs {
                for (key, child) in refs {
                    assert_eq!(
                        full.refs.get(nid).and_then(|m| m.get(key)),
                        Some(child),
                        "logged ref ({nid}, {key}) diverges from the tree"
                    );
                }
            }
            // Net removals must be gone from the tree.
            for (nid, keys) in &log.removed {
                for key in keys {
                    assert!(
                        full.values.get(nid).is_none_or(|m| !m.contains_key(key)),
                        "removed row ({nid}, {key}) still has a value"
                    );
                    assert!(
                        full.refs.get(nid).is_none_or(|m| !m.contains_key(key)),
                        "removed row ({nid}, {key}) still has a ref"
                    );
                }
            }
            // Conversely, every current row except the root's pre-existing
            // baseline must have come from a logged write.
            let root = NodeId::root();
            for (nid, values) in &full.values {
                for key in values.keys() {
                    let logged = log
                        .values
                        .get(nid)
                        .is_some_and(|m| m.contains_key(key));
                    let baseline = *nid == root && (key == "$kind" || key == "$parent");
                    assert!(
                        logged || baseline,
                        "current row ({nid}, {key}) has no origin in the log"
                    );
                }
            }
        });
    }
}
