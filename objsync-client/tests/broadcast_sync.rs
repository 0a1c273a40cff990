//! Multi-tab consistency over the local broadcast channel.
//!
//! The local path is peer-to-peer: the hub appends every update without a
//! base-revision check, so two tabs writing against the same base both land
//! and every participant converges on the appended order.

use objsync_client::{BroadcastHub, SyncClient, SyncClientOptions};
use objsync_core::{Op, PathSeg};
use serde_json::{json, Value};
use std::time::Duration;

fn set(prop: &str, value: Value) -> Op {
    Op::Set {
        path: vec![PathSeg::Key(prop.to_string())],
        value,
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_two_tabs_converge() {
    let hub = BroadcastHub::new();
    let a = SyncClient::new(
        "doc1",
        "a",
        hub.transport("chan"),
        SyncClientOptions::default(),
    );
    let b = SyncClient::new(
        "doc1",
        "b",
        hub.transport("chan"),
        SyncClientOptions::default(),
    );

    a.connect().await.unwrap();
    a.wait_ready().await;
    b.connect().await.unwrap();
    b.wait_ready().await;

    a.send_op(set("x", json!(1))).await.unwrap();
    b.send_op(set("y", json!(2))).await.unwrap();

    wait_until(|| {
        a.state() == json!({"x": 1, "y": 2}) && b.state() == json!({"x": 1, "y": 2})
    })
    .await;
    assert_eq!(a.revision(), 2);
    assert_eq!(b.revision(), 2);
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot() {
    let hub = BroadcastHub::new();
    let a = SyncClient::new(
        "doc1",
        "a",
        hub.transport("chan"),
        SyncClientOptions::default(),
    );
    a.connect().await.unwrap();
    a.wait_ready().await;

    a.send_op(set("x", json!(1))).await.unwrap();
    a.send_op(set("y", json!(2))).await.unwrap();
    wait_until(|| a.revision() == 2).await;

    let c = SyncClient::new(
        "doc1",
        "c",
        hub.transport("chan"),
        SyncClientOptions::default(),
    );
    c.connect().await.unwrap();
    c.wait_ready().await;

    assert_eq!(c.revision(), 2);
    assert_eq!(c.state(), json!({"x": 1, "y": 2}));
}

#[tokio::test]
async fn test_channels_are_independent() {
    let hub = BroadcastHub::new();
    let a = SyncClient::new(
        "doc1",
        "a",
        hub.transport("chan-1"),
        SyncClientOptions::default(),
    );
    let b = SyncClient::new(
        "doc2",
        "b",
        hub.transport("chan-2"),
        SyncClientOptions::default(),
    );

    a.connect().await.unwrap();
    a.wait_ready().await;
    b.connect().await.unwrap();
    b.wait_ready().await;

    a.send_op(set("only_a", json!(true))).await.unwrap();
    wait_until(|| a.revision() == 1).await;

    assert_eq!(b.revision(), 0);
    assert_eq!(b.state(), json!({}));
}
