//! tests/common/harness.rs
//!
//! A test harness for creating and managing clusters of real nodes. This
//! module provides the building blocks for all integration tests,
//! abstracting away the boilerplate of:
//! - Allocating ephemeral ports and per-node configuration.
//! - Spawning nodes in the background and waiting for readiness.
//! - Driving the client HTTP surface (writes, reads, key listings).
//! - Opening raw attachment sessions to exercise the handshake directly.
//! - Managing graceful shutdown.

use anyhow::{Context, Result};
use repram::{
    attach::frame::{Capabilities, Frame, FrameKind, HelloPayload},
    config::InboundCapability,
    App, Config,
};
use reqwest::StatusCode;
use std::{
    net::{SocketAddr, TcpListener},
    time::Duration,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub type WsSession = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Allocates a port that is free right now. The tiny race between drop and
/// bind is acceptable in tests.
pub fn ephemeral_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    listener.local_addr().expect("local addr").port()
}

/// Baseline node configuration for tests: localhost, ephemeral ports, short
/// write timeout, and a 1-second minimum TTL so expiry is testable.
pub fn test_config(node_id: &str) -> Config {
    Config {
        node_id: node_id.to_string(),
        address: "127.0.0.1".to_string(),
        http_port: ephemeral_port(),
        gossip_port: ephemeral_port(),
        min_ttl: 1,
        write_timeout: 2,
        ..Config::default()
    }
}

/// A handle to a running node instance in a test environment.
pub struct TestNode {
    pub config: Config,
    pub node_id: String,
    pub http_addr: SocketAddr,
    pub shutdown_token: CancellationToken,
    client: reqwest::Client,
}

impl TestNode {
    /// Spawns a node with the given configuration and waits until its HTTP
    /// surface answers health checks.
    pub async fn spawn(config: Config) -> Result<Self> {
        let http_addr: SocketAddr = format!("{}:{}", config.address, config.http_port)
            .parse()
            .context("node address")?;

        let app = App::new(config.clone()).context("Failed to create app")?;
        let shutdown_token = app.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = app.run().await {
                tracing::error!(error = %e, "Test node failed");
            }
        });

        let node = Self {
            node_id: config.node_id.clone(),
            config,
            http_addr,
            shutdown_token,
            client: reqwest::Client::new(),
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let healthy = node
                .client
                .get(node.url("/v1/health"))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if healthy {
                break;
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "node did not become healthy"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        info!(node_id = %node.node_id, http = %node.http_addr, "Spawned test node");
        Ok(node)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    /// The `host:port` form used in another node's `bootstrap_peers`.
    pub fn seed_entry(&self) -> String {
        self.http_addr.to_string()
    }

    pub async fn put_value(&self, key: &str, body: &[u8], ttl: u64) -> Result<StatusCode> {
        let response = self
            .client
            .put(self.url(&format!("/v1/data/{key}?ttl={ttl}")))
            .body(body.to_vec())
            .send()
            .await?;
        Ok(response.status())
    }

    /// Reads a value; `None` on 404. Returns the body and response headers.
    pub async fn get_value(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, reqwest::header::HeaderMap)>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/data/{key}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        anyhow::ensure!(
            response.status().is_success(),
            "unexpected status {}",
            response.status()
        );
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(Some((body, headers)))
    }

    pub async fn list_keys(&self, query: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(self.url(&format!("/v1/keys{query}")))
            .send()
            .await?;
        anyhow::ensure!(response.status().is_success(), "keys failed");
        Ok(response.json().await?)
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let response = self.client.get(self.url("/v1/status")).send().await?;
        anyhow::ensure!(response.status().is_success(), "status failed");
        Ok(response.json().await?)
    }

    pub async fn peer_count(&self) -> usize {
        self.status()
            .await
            .ok()
            .and_then(|s| s["peer_count"].as_u64())
            .unwrap_or(0) as usize
    }

    pub async fn child_count(&self) -> usize {
        self.status()
            .await
            .ok()
            .and_then(|s| s["child_count"].as_u64())
            .unwrap_or(0) as usize
    }

    /// Registers a (possibly fictitious) peer in this node's directory via
    /// the bootstrap endpoint, exactly as a joining node would.
    pub async fn register_peer(&self, id: &str, http_port: u16) -> Result<()> {
        let body = serde_json::json!({
            "node_id": id,
            "address": "127.0.0.1",
            "gossip_port": http_port,
            "http_port": http_port,
            "enclave": "default",
        });
        let response = self
            .client
            .post(self.url("/v1/bootstrap"))
            .json(&body)
            .send()
            .await?;
        anyhow::ensure!(response.status().is_success(), "bootstrap failed");
        Ok(())
    }

    /// Opens a raw attachment session and sends a hello, returning the
    /// socket ready for frame-level assertions.
    pub async fn open_attachment(&self, node_id: &str, enclave: &str) -> Result<WsSession> {
        self.open_attachment_with_secret(node_id, enclave, None).await
    }

    /// Like [`TestNode::open_attachment`], signing the hello when a secret
    /// is given.
    pub async fn open_attachment_with_secret(
        &self,
        node_id: &str,
        enclave: &str,
        secret: Option<&str>,
    ) -> Result<WsSession> {
        let (mut ws, _) = connect_async(format!("ws://{}/v1/ws", self.http_addr))
            .await
            .context("attachment connect failed")?;

        let hello = HelloPayload {
            node_id: node_id.to_string(),
            enclave: enclave.to_string(),
            address: "127.0.0.1".to_string(),
            http_port: 1, // Nothing listens: probes detect us as transient.
            capabilities: Capabilities {
                inbound: InboundCapability::False,
            },
        };
        let frame = Frame::new(FrameKind::Hello, &hello, secret)?;
        use futures::SinkExt;
        ws.send(WsMessage::Text(frame.to_text()?)).await?;
        Ok(ws)
    }

    /// Shuts down the node gracefully.
    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

/// Sends one protocol frame over a raw session.
pub async fn send_frame(ws: &mut WsSession, frame: &Frame) -> Result<()> {
    use futures::SinkExt;
    ws.send(WsMessage::Text(frame.to_text()?)).await?;
    Ok(())
}

/// Reads the next protocol frame off a raw session, skipping WS control
/// messages.
pub async fn next_frame(ws: &mut WsSession) -> Result<Frame> {
    use futures::StreamExt;
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            let message = ws
                .next()
                .await
                .context("session ended")?
                .context("session error")?;
            if let WsMessage::Text(text) = message {
                return Ok(Frame::from_text(&text)?);
            }
        }
    })
    .await
    .context("timed out waiting for frame")?
}

/// Waits until `node` reports exactly `count` directory peers.
pub async fn wait_for_peer_count(node: &TestNode, count: usize, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if node.peer_count().await == count {
            return Ok(());
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "{} never reached {count} peers",
            node.node_id
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until `node` reports exactly `count` attached children.
pub async fn wait_for_child_count(node: &TestNode, count: usize, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if node.child_count().await == count {
            return Ok(());
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "{} never reached {count} children",
            node.node_id
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until a single child is attached somewhere among `substrates`,
/// returning the index of the node holding it.
pub async fn wait_for_attached(substrates: &[&TestNode], timeout: Duration) -> Result<usize> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for (index, node) in substrates.iter().enumerate() {
            if node.child_count().await == 1 {
                return Ok(index);
            }
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "no substrate gained a child"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Waits until reading `key` on `node` yields `expected`.
pub async fn wait_for_value(
    node: &TestNode,
    key: &str,
    expected: &[u8],
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some((body, _))) = node.get_value(key).await {
            if body == expected {
                return Ok(());
            }
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "{} never converged on key {key}",
            node.node_id
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
