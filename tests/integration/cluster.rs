//! tests/integration/cluster.rs
//!
//! End-to-end tests for bootstrap discovery, the signed node-to-node
//! endpoints, and the metadata surfaces.

use crate::common::harness::{self, test_config, TestNode};
use repram::{auth, domain::Message};
use reqwest::StatusCode;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_bootstrap_chain_converges_directories() {
    // C bootstraps via A alone but must learn B too, because A's bootstrap
    // response carries its whole directory.
    let node_a = TestNode::spawn(test_config("chain-a")).await.unwrap();

    let mut config_b = test_config("chain-b");
    config_b.bootstrap_peers = vec![node_a.seed_entry()];
    let node_b = TestNode::spawn(config_b).await.unwrap();

    let mut config_c = test_config("chain-c");
    config_c.bootstrap_peers = vec![node_a.seed_entry()];
    let node_c = TestNode::spawn(config_c).await.unwrap();

    harness::wait_for_peer_count(&node_c, 2, Duration::from_secs(5))
        .await
        .expect("C should learn A and B from one seed");
    assert_eq!(node_a.peer_count().await, 2);

    node_a.shutdown();
    node_b.shutdown();
    node_c.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_bootstrap_falls_through_dead_seeds() {
    let node_a = TestNode::spawn(test_config("seed-live")).await.unwrap();

    let mut config_b = test_config("joiner");
    config_b.bootstrap_peers = vec!["127.0.0.1:1".to_string(), node_a.seed_entry()];
    let node_b = TestNode::spawn(config_b).await.unwrap();

    harness::wait_for_peer_count(&node_b, 1, Duration::from_secs(5))
        .await
        .expect("the second seed should have served the join");

    node_a.shutdown();
    node_b.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_signed_endpoints_reject_bad_signatures() {
    let mut config = test_config("secured");
    config.cluster_secret = "s3cret".to_string();
    let node = TestNode::spawn(config).await.unwrap();

    let client = reqwest::Client::new();
    let message = Message::ping("stranger");
    let body = serde_json::to_vec(&message).unwrap();

    // Unsigned.
    let response = client
        .post(node.url("/v1/gossip/message"))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Wrong secret.
    let response = client
        .post(node.url("/v1/gossip/message"))
        .header(auth::SIGNATURE_HEADER, auth::sign("wrong", &body))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Correctly signed over the exact bytes.
    let response = client
        .post(node.url("/v1/gossip/message"))
        .header(auth::SIGNATURE_HEADER, auth::sign("s3cret", &body))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Bootstrap is a signed endpoint too.
    let join = serde_json::json!({
        "node_id": "stranger",
        "address": "127.0.0.1",
        "gossip_port": 1,
        "http_port": 1,
    });
    let response = client
        .post(node.url("/v1/bootstrap"))
        .json(&join)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_direct_sync_message_adds_peer() {
    let node = TestNode::spawn(test_config("syncable")).await.unwrap();

    let sync = serde_json::json!({
        "type": "SYNC",
        "from": "visitor",
        "timestamp": 1,
        "message_id": "test-sync-1",
        "node_info": {
            "id": "visitor",
            "address": "127.0.0.1",
            "port": 1,
            "http_port": 1,
            "enclave": "default",
        },
    });
    let response = reqwest::Client::new()
        .post(node.url("/v1/gossip/message"))
        .json(&sync)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    harness::wait_for_peer_count(&node, 1, Duration::from_secs(2))
        .await
        .unwrap();

    node.shutdown();
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_metadata_surfaces() {
    let node = TestNode::spawn(test_config("meta")).await.unwrap();
    node.put_value("k", b"v", 300).await.unwrap();

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(node.url("/v1/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["node_id"], "meta");

    let status = node.status().await.unwrap();
    assert_eq!(status["node_id"], "meta");
    assert_eq!(status["enclave"], "default");
    assert_eq!(status["store"]["keys"], 1);
    assert_eq!(status["store"]["value_bytes"], 1);
    assert_eq!(status["pending_writes"], 0);

    let topology: serde_json::Value = client
        .get(node.url("/v1/topology"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(topology["self"]["id"], "meta");
    assert_eq!(topology["peers"].as_array().unwrap().len(), 0);

    node.shutdown();
}
