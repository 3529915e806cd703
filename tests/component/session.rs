//! tests/component/session.rs
//!
//! Frame-level tests of the attachment protocol against a single real node,
//! driving a raw session the way a foreign-language transient would: send
//! frames, assert on the frames that come back, and cross-check effects
//! through the HTTP surface.

use crate::common::harness::{self, next_frame, test_config, TestNode};
use repram::{
    attach::frame::{Frame, FrameKind},
    domain::{Message, MessageKind},
};
use std::time::Duration;
use test_log::test;

fn substrate(node_id: &str) -> repram::Config {
    let mut config = test_config(node_id);
    config.max_children = 4;
    config
}

/// Attaches and consumes the welcome, leaving the session mid-stream.
async fn attached_session(
    node: &TestNode,
    child_id: &str,
) -> harness::WsSession {
    let mut ws = node.open_attachment(child_id, "default").await.unwrap();
    let welcome = next_frame(&mut ws).await.unwrap();
    assert_eq!(welcome.kind, FrameKind::Welcome);
    ws
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_put_frame_is_stored_and_acked_immediately() {
    let node = TestNode::spawn(substrate("frame-sub")).await.unwrap();
    let mut ws = attached_session(&node, "t1").await;

    let put = Message::put("t1", "session-key", b"via-session".to_vec(), 300);
    harness::send_frame(&mut ws, &Frame::for_message(&put, None).unwrap())
        .await
        .unwrap();

    // The substrate's local store is the child's first confirmation.
    let ack_frame = next_frame(&mut ws).await.unwrap();
    assert_eq!(ack_frame.kind, FrameKind::Ack);
    let ack: Message = ack_frame.decode().unwrap();
    assert_eq!(ack.message_id, put.message_id);
    assert_eq!(ack.from, "frame-sub");
    assert_eq!(ack.to, "t1");

    // And the value is live on the node's data plane.
    let (body, headers) = node.get_value("session-key").await.unwrap().unwrap();
    assert_eq!(body, b"via-session");
    assert_eq!(headers.get("x-original-ttl").unwrap(), "300");

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_duplicate_put_frame_is_acked_once() {
    let node = TestNode::spawn(substrate("dedup-sub")).await.unwrap();
    let mut ws = attached_session(&node, "t1").await;

    let put = Message::put("t1", "once", b"v".to_vec(), 300);
    let frame = Frame::for_message(&put, None).unwrap();
    harness::send_frame(&mut ws, &frame).await.unwrap();
    harness::send_frame(&mut ws, &frame).await.unwrap();

    let first = next_frame(&mut ws).await.unwrap();
    assert_eq!(first.kind, FrameKind::Ack);

    // A ping makes a convenient fence: if the duplicate had produced a
    // second ACK, it would arrive before the pong.
    let ping = Message::ping("t1");
    harness::send_frame(&mut ws, &Frame::for_message(&ping, None).unwrap())
        .await
        .unwrap();
    let fence = next_frame(&mut ws).await.unwrap();
    assert_eq!(fence.kind, FrameKind::Pong);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_mesh_ack_is_reverse_routed_to_originating_session() {
    let node = TestNode::spawn(substrate("route-sub")).await.unwrap();
    let mut ws = attached_session(&node, "t1").await;

    let put = Message::put("t1", "routed", b"v".to_vec(), 300);
    harness::send_frame(&mut ws, &Frame::for_message(&put, None).unwrap())
        .await
        .unwrap();
    let immediate = next_frame(&mut ws).await.unwrap();
    assert_eq!(immediate.kind, FrameKind::Ack);

    // A mesh peer confirms the relayed copy over HTTP; the substrate must
    // forward that ACK down the session rather than counting it itself.
    let mesh_ack = Message::ack("mesh-peer", "route-sub", &put.message_id);
    let response = reqwest::Client::new()
        .post(node.url("/v1/gossip/message"))
        .json(&mesh_ack)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let routed = next_frame(&mut ws).await.unwrap();
    assert_eq!(routed.kind, FrameKind::Ack);
    let routed: Message = routed.decode().unwrap();
    assert_eq!(routed.from, "mesh-peer");
    assert_eq!(routed.message_id, put.message_id);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_sibling_sessions_receive_each_others_puts() {
    let node = TestNode::spawn(substrate("sibling-sub")).await.unwrap();
    let mut ws_a = attached_session(&node, "child-a").await;
    let mut ws_b = attached_session(&node, "child-b").await;

    let put = Message::put("child-a", "shared", b"hello-sibling".to_vec(), 300);
    harness::send_frame(&mut ws_a, &Frame::for_message(&put, None).unwrap())
        .await
        .unwrap();

    // The sibling gets the original PUT, originator id intact.
    let forwarded = next_frame(&mut ws_b).await.unwrap();
    assert_eq!(forwarded.kind, FrameKind::Put);
    let forwarded: Message = forwarded.decode().unwrap();
    assert_eq!(forwarded.kind, MessageKind::Put);
    assert_eq!(forwarded.from, "child-a");
    assert_eq!(forwarded.key, "shared");
    assert_eq!(forwarded.value_bytes(), b"hello-sibling");

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ping_frame_gets_pong() {
    let node = TestNode::spawn(substrate("pong-sub")).await.unwrap();
    let mut ws = attached_session(&node, "t1").await;

    let ping = Message::ping("t1");
    harness::send_frame(&mut ws, &Frame::for_message(&ping, None).unwrap())
        .await
        .unwrap();

    let pong = next_frame(&mut ws).await.unwrap();
    assert_eq!(pong.kind, FrameKind::Pong);
    let pong: Message = pong.decode().unwrap();
    assert_eq!(pong.node_info.unwrap().id, "pong-sub");

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_unsigned_hello_is_rejected_when_secret_configured() {
    let mut config = substrate("strict-sub");
    config.cluster_secret = "s3cret".to_string();
    let node = TestNode::spawn(config).await.unwrap();

    // Unsigned hello: the substrate closes without a welcome.
    let mut ws = node.open_attachment("t1", "default").await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), next_frame(&mut ws)).await;
    assert!(
        result.is_err() || result.unwrap().is_err(),
        "no welcome may be issued to an unsigned hello"
    );
    assert_eq!(node.child_count().await, 0);

    // A properly signed hello attaches normally.
    let mut ws = node
        .open_attachment_with_secret("t2", "default", Some("s3cret"))
        .await
        .unwrap();
    let welcome = next_frame(&mut ws).await.unwrap();
    assert_eq!(welcome.kind, FrameKind::Welcome);
    assert!(welcome.verify(Some("s3cret")));

    node.shutdown();
}
