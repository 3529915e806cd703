//! tests/integration/write_path.rs
//!
//! End-to-end tests for the client write contract: quorum confirmation,
//! best-effort acceptance, TTL expiry, and the shell's guardrails.

use crate::common::harness::{self, test_config, TestNode};
use reqwest::StatusCode;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_single_node_write_round_trip() {
    // A lone node with replication_factor 3 has quorum 1: its own store
    // confirms the write immediately.
    let node = TestNode::spawn(test_config("solo")).await.unwrap();

    let status = node.put_value("foo", b"hello", 600).await.unwrap();
    assert_eq!(status, StatusCode::CREATED);

    let (body, headers) = node.get_value("foo").await.unwrap().unwrap();
    assert_eq!(body, b"hello");
    assert_eq!(headers.get("x-original-ttl").unwrap(), "600");
    assert!(headers.get("x-created-at").is_some());
    let remaining: u64 = headers
        .get("x-remaining-ttl")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(remaining <= 600 && remaining >= 595);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_quorum_write_in_three_node_enclave() {
    let node_a = TestNode::spawn(test_config("node-a")).await.unwrap();

    let mut config_b = test_config("node-b");
    config_b.bootstrap_peers = vec![node_a.seed_entry()];
    let node_b = TestNode::spawn(config_b).await.unwrap();

    let mut config_c = test_config("node-c");
    config_c.bootstrap_peers = vec![node_a.seed_entry()];
    let node_c = TestNode::spawn(config_c).await.unwrap();

    // A must see both replicas before the write fans out.
    harness::wait_for_peer_count(&node_a, 2, Duration::from_secs(5))
        .await
        .unwrap();

    let status = node_a.put_value("city", b"vaduz", 300).await.unwrap();
    assert_eq!(status, StatusCode::CREATED, "one remote ACK reaches quorum 2");

    // Replication converges on every enclave member.
    for node in [&node_b, &node_c] {
        harness::wait_for_value(node, "city", b"vaduz", Duration::from_secs(5))
            .await
            .unwrap();
    }

    node_a.shutdown();
    node_b.shutdown();
    node_c.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_black_holed_peer_yields_accepted() {
    // A knows one peer that drops everything: quorum 2 is unreachable, so
    // the deadline converts the write to 202 with the local copy kept.
    let node = TestNode::spawn(test_config("lonely")).await.unwrap();
    node.register_peer("ghost", 1).await.unwrap();

    let started = std::time::Instant::now();
    let status = node.put_value("k", b"v", 300).await.unwrap();
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(
        started.elapsed() >= Duration::from_secs(2),
        "202 must wait out the write deadline"
    );

    let (body, _) = node.get_value("k").await.unwrap().unwrap();
    assert_eq!(body, b"v");

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_ttl_expiry_removes_key_everywhere() {
    let node = TestNode::spawn(test_config("ephemeral")).await.unwrap();

    // Requested TTL below min_ttl (1 s in tests) is clamped up to it.
    let status = node.put_value("fleeting", b"soon gone", 1).await.unwrap();
    assert_eq!(status, StatusCode::CREATED);
    assert!(node.get_value("fleeting").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(node.get_value("fleeting").await.unwrap().is_none());
    let keys = node.list_keys("").await.unwrap();
    assert_eq!(keys["keys"].as_array().unwrap().len(), 0);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_overwrite_refreshes_ttl_window() {
    let node = TestNode::spawn(test_config("rewriter")).await.unwrap();

    node.put_value("k", b"first", 100).await.unwrap();
    node.put_value("k", b"second", 900).await.unwrap();

    let (body, headers) = node.get_value("k").await.unwrap().unwrap();
    assert_eq!(body, b"second");
    assert_eq!(headers.get("x-original-ttl").unwrap(), "900");

    let keys = node.list_keys("").await.unwrap();
    assert_eq!(keys["keys"].as_array().unwrap().len(), 1);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_keys_pagination_with_prefix_and_cursor() {
    let node = TestNode::spawn(test_config("lister")).await.unwrap();

    for key in ["app:a", "app:b", "app:c", "zzz"] {
        node.put_value(key, b"v", 300).await.unwrap();
    }

    let page1 = node.list_keys("?prefix=app:&limit=2").await.unwrap();
    assert_eq!(page1["keys"], serde_json::json!(["app:a", "app:b"]));
    assert_eq!(page1["next_cursor"], "app:b");

    let page2 = node
        .list_keys("?prefix=app:&limit=2&cursor=app:b")
        .await
        .unwrap();
    assert_eq!(page2["keys"], serde_json::json!(["app:c"]));
    assert!(page2.get("next_cursor").is_none());

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_write_without_ttl_is_rejected() {
    let node = TestNode::spawn(test_config("strict")).await.unwrap();

    let response = reqwest::Client::new()
        .put(node.url("/v1/data/nottl"))
        .body("value")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The X-TTL header is an accepted alternative to the query parameter.
    let response = reqwest::Client::new()
        .put(node.url("/v1/data/headerttl"))
        .header("x-ttl", "300")
        .body("value")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_oversized_body_yields_413() {
    let mut config = test_config("tiny");
    config.max_value_bytes = 16;
    let node = TestNode::spawn(config).await.unwrap();

    let status = node.put_value("big", &[0u8; 64], 300).await.unwrap();
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_full_store_yields_507() {
    let mut config = test_config("cramped");
    config.max_storage_bytes = 8;
    let node = TestNode::spawn(config).await.unwrap();

    assert_eq!(
        node.put_value("a", b"123456", 300).await.unwrap(),
        StatusCode::CREATED
    );
    assert_eq!(
        node.put_value("b", b"123456", 300).await.unwrap(),
        StatusCode::INSUFFICIENT_STORAGE
    );

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_rate_limit_yields_429_with_retry_after() {
    let mut config = test_config("throttled");
    config.rate_limit = 2;
    let node = TestNode::spawn(config).await.unwrap();

    let client = reqwest::Client::new();
    let mut last = StatusCode::OK;
    for _ in 0..5 {
        let response = client
            .put(node.url("/v1/data/burst?ttl=300"))
            .body("v")
            .send()
            .await
            .unwrap();
        last = response.status();
        if last == StatusCode::TOO_MANY_REQUESTS {
            assert_eq!(response.headers().get("retry-after").unwrap(), "1");
            break;
        }
    }
    assert_eq!(last, StatusCode::TOO_MANY_REQUESTS);

    // Cluster endpoints stay reachable under client throttling.
    assert!(node.status().await.is_ok());

    node.shutdown();
}
