//! Projection scenario tests: known trees rendered to PlainLson and lossy
//! JSON, with the streaming serializer checked against the eager one.

use livetree::driver::StorageDriver;
use livetree::node::NodeId;
use livetree::pos::Position;
use livetree::serialize::{JsonChunks, to_lossy_json, to_plain_lson};
use serde_json::json;

use crate::helpers::{put_list, put_object, put_register, test_driver};

#[tokio::test]
async fn empty_document_renders_as_empty_object() {
    let driver = test_driver().await;
    let snapshot = driver.get_snapshot(false).await.unwrap();

    assert_eq!(to_lossy_json(&snapshot).unwrap(), json!({}));
    assert_eq!(
        to_plain_lson(&snapshot).unwrap(),
        json!({"liveblocksType": "LiveObject", "data": {}})
    );
    assert_eq!(
        JsonChunks::lossy_json(&snapshot).collect_string().unwrap(),
        "{}"
    );
    snapshot.destroy();
}

#[tokio::test]
async fn nested_objects_render_with_envelopes() {
    let driver = test_driver().await;
    driver
        .set_object_data(
            &NodeId::root(),
            json!({"ver": 1}).as_object().unwrap().clone(),
            false,
        )
        .await
        .unwrap();
    put_object(driver.as_ref(), "c1", "root", "child", json!({"a": 1})).await;
    put_object(driver.as_ref(), "s1", "c1", "subchild1", json!({"b": 2})).await;

    let snapshot = driver.get_snapshot(false).await.unwrap();
    assert_eq!(
        to_lossy_json(&snapshot).unwrap(),
        json!({"ver": 1, "child": {"a": 1, "subchild1": {"b": 2}}})
    );
    assert_eq!(
        to_plain_lson(&snapshot).unwrap(),
        json!({
            "liveblocksType": "LiveObject",
            "data": {
                "ver": 1,
                "child": {
                    "liveblocksType": "LiveObject",
                    "data": {
                        "a": 1,
                        "subchild1": {
                            "liveblocksType": "LiveObject",
                            "data": {"b": 2}
                        }
                    }
                }
            }
        })
    );
    snapshot.destroy();
}

#[tokio::test]
async fn lists_render_registers_in_position_order() {
    let driver = test_driver().await;
    put_list(driver.as_ref(), "l1", "root", "list1").await;
    let first = Position::first();
    // Insert out of order; positions, not insertion order, decide.
    put_register(driver.as_ref(), "r2", "l1", &first.after(), json!(1)).await;
    put_register(driver.as_ref(), "r1", "l1", &first, json!(0)).await;

    let snapshot = driver.get_snapshot(false).await.unwrap();
    assert_eq!(to_lossy_json(&snapshot).unwrap(), json!({"list1": [0, 1]}));
    assert_eq!(
        to_plain_lson(&snapshot).unwrap(),
        json!({
            "liveblocksType": "LiveObject",
            "data": {
                "list1": {"liveblocksType": "LiveList", "data": [0, 1]}
            }
        })
    );
    snapshot.destroy();
}

#[tokio::test]
async fn streaming_output_matches_eager_output() {
    let driver = test_driver().await;
    driver
        .set_object_data(
            &NodeId::root(),
            json!({"title": "doc", "n": 3.5, "flag": null})
                .as_object()
                .unwrap()
                .clone(),
            false,
        )
        .await
        .unwrap();
    put_object(driver.as_ref(), "o1", "root", "obj", json!({"k": [1, {"x": 2}]})).await;
    put_list(driver.as_ref(), "l1", "o1", "items").await;
    let pos = Position::first();
    put_register(driver.as_ref(), "r1", "l1", &pos, json!("quote \"me\"")).await;
    put_register(driver.as_ref(), "r2", "l1", &pos.after(), json!({"deep": []})).await;

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
}

#[tokio::test]
async fn streamed_chunks_parse_as_valid_json() {
    let driver = test_driver().await;
    put_object(driver.as_ref(), "o1", "root", "a", json!({"x": 1})).await;
    put_list(driver.as_ref(), "l1", "root", "b").await;
    put_register(driver.as_ref(), "r1", "l1", &Position::first(), json!(true)).await;

    let snapshot = driver.get_snapshot(false).await.unwrap();
    let text = JsonChunks::plain_lson(&snapshot).collect_string().unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, to_plain_lson(&snapshot).unwrap());
    snapshot.destroy();
}
