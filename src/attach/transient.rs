//! src/attach/transient.rs
//!
//! The transient side of the attachment layer: a NAT-bound node's outbound
//! persistent session to a substrate. The session is this node's only path
//! into the mesh; writes go up through the parent and replicas come back
//! down the same socket.

use crate::{
    api::AppState,
    attach::{
        frame::{AlternativeParent, Frame, FrameKind, GoodbyePayload, HelloPayload, WelcomePayload},
        session_channel, ParentHandle, HEARTBEAT_INTERVAL, MAX_MISSED_PONGS,
    },
    attach::frame::Capabilities,
    domain::{Message, MessageKind, NodeIdentity},
    error::{Error, Result},
};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// How long a connect + handshake may take against one candidate.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A substrate we might attach to, from the peer directory or from a
/// goodbye's alternatives list.
#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub id: String,
    pub address: String,
    pub http_port: u16,
}

impl AttachTarget {
    fn ws_url(&self) -> String {
        format!("ws://{}:{}/v1/ws", self.address, self.http_port)
    }
}

impl From<NodeIdentity> for AttachTarget {
    fn from(peer: NodeIdentity) -> Self {
        Self {
            id: peer.id,
            address: peer.address,
            http_port: peer.http_port,
        }
    }
}

impl From<AlternativeParent> for AttachTarget {
    fn from(alt: AlternativeParent) -> Self {
        Self {
            id: alt.id,
            address: alt.address,
            http_port: alt.http_port,
        }
    }
}

/// Why a session ended.
enum SessionEnd {
    /// The parent redirected us; walk these alternatives next.
    Goodbye(Vec<AlternativeParent>),
    /// The session closed (error, heartbeat loss, or shutdown).
    Closed,
}

/// Candidate substrates from the current directory, same-enclave first.
fn initial_candidates(state: &AppState) -> VecDeque<AttachTarget> {
    let mut peers = state.gossip.peers();
    peers.sort_by_key(|peer| peer.enclave != state.local.enclave);
    peers.into_iter().map(AttachTarget::from).collect()
}

/// The attachment client service. Attaches to the first willing substrate;
/// on goodbye, walks the offered alternatives in order. When every candidate
/// is exhausted the node stays up in degraded mode — local reads keep
/// working, and a restart or later bootstrap re-triggers attachment.
pub async fn run(state: AppState, shutdown_token: CancellationToken) {
    let mut queue = initial_candidates(&state);
    if queue.is_empty() {
        tracing::warn!("No known substrates to attach to; running detached");
        return;
    }

    while let Some(target) = queue.pop_front() {
        if shutdown_token.is_cancelled() {
            return;
        }
        match attach_and_run(&state, &target, &shutdown_token).await {
            Ok(SessionEnd::Goodbye(alternatives)) => {
                tracing::info!(
                    parent_id = %target.id,
                    alternatives = alternatives.len(),
                    "Parent said goodbye; migrating"
                );
                queue = alternatives.into_iter().map(AttachTarget::from).collect();
            }
            Ok(SessionEnd::Closed) => {
                if shutdown_token.is_cancelled() {
                    return;
                }
                tracing::info!(parent_id = %target.id, "Session closed; trying next candidate");
            }
            Err(e) => {
                tracing::debug!(target = %target.ws_url(), error = %e, "Attachment attempt failed");
            }
        }
    }

    tracing::warn!(
        "All substrate candidates failed; continuing in degraded mode with local reads only"
    );
}

async fn attach_and_run(
    state: &AppState,
    target: &AttachTarget,
    shutdown_token: &CancellationToken,
) -> Result<SessionEnd> {
    let secret = state.attach.cluster_secret();

    let (mut ws, _) = time::timeout(HANDSHAKE_TIMEOUT, connect_async(target.ws_url()))
        .await
        .map_err(|_| Error::Session("connect timeout".to_string()))?
        .map_err(|e| Error::Session(e.to_string()))?;

    // --- Handshake ---
    let hello = HelloPayload {
        node_id: state.local.id.clone(),
        enclave: state.local.enclave.clone(),
        address: state.local.address.clone(),
        http_port: state.local.http_port,
        capabilities: Capabilities {
            inbound: state.config.inbound,
        },
    };
    send_frame(&mut ws, &Frame::new(FrameKind::Hello, &hello, secret)?).await?;

    let opening = time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut ws))
        .await
        .map_err(|_| Error::Session("handshake timeout".to_string()))?
        .ok_or_else(|| Error::Session("closed during handshake".to_string()))?;

    if !opening.verify(secret) {
        return Err(Error::Session("handshake frame failed signature check".to_string()));
    }
    match opening.kind {
        FrameKind::Goodbye => {
            let goodbye: GoodbyePayload = opening.decode()?;
            return Ok(SessionEnd::Goodbye(goodbye.alternative_parents));
        }
        FrameKind::Welcome => {}
        other => {
            return Err(Error::Session(format!(
                "expected welcome, got {other:?}"
            )));
        }
    }
    let welcome: WelcomePayload = opening.decode()?;

    let parent_id = welcome.your_position.parent_id.clone();
    tracing::info!(
        parent_id = %parent_id,
        depth = welcome.your_position.depth,
        inbound_detected = welcome.inbound_detected,
        topology = welcome.topology.len(),
        "Attached to substrate"
    );

    // The welcome topology is our seed peer set.
    for entry in &welcome.topology {
        if let Some(info) = &entry.node_info {
            state.gossip.add_peer(info.clone());
        }
    }

    let (tx, mut outbound_rx) = session_channel();
    state
        .attach
        .set_parent(ParentHandle::new(parent_id.clone(), tx));

    // --- Session loop ---
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // Immediate first tick.
    let mut missed_pongs: u32 = 0;

    let end = loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                let goodbye = GoodbyePayload {
                    reason: "shutting down".to_string(),
                    alternative_parents: Vec::new(),
                };
                if let Ok(frame) = Frame::new(FrameKind::Goodbye, &goodbye, secret) {
                    let _ = send_frame(&mut ws, &frame).await;
                }
                break SessionEnd::Closed;
            }
            Some(frame) = outbound_rx.recv() => {
                if send_frame(&mut ws, &frame).await.is_err() {
                    break SessionEnd::Closed;
                }
            }
            inbound = read_frame(&mut ws) => {
                let Some(frame) = inbound else { break SessionEnd::Closed };
                if !frame.verify(secret) {
                    tracing::warn!(parent_id = %parent_id, "Dropping frame with bad signature");
                    continue;
                }
                match frame.kind {
                    FrameKind::Goodbye => {
                        let alternatives = frame
                            .decode::<GoodbyePayload>()
                            .map(|g| g.alternative_parents)
                            .unwrap_or_default();
                        break SessionEnd::Goodbye(alternatives);
                    }
                    FrameKind::Pong => missed_pongs = 0,
                    _ => dispatch_parent_frame(state, frame),
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    tracing::warn!(parent_id = %parent_id, "Parent missed heartbeats; terminating session");
                    break SessionEnd::Closed;
                }
                missed_pongs += 1;
                let ping = Message::ping(&state.local.id);
                match Frame::for_message(&ping, secret) {
                    Ok(frame) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            break SessionEnd::Closed;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to frame heartbeat"),
                }
            }
        }
    };

    state.attach.clear_parent(&parent_id);
    Ok(end)
}

/// Routes one inbound parent frame into the shared pipelines.
fn dispatch_parent_frame(state: &AppState, frame: Frame) {
    if !frame.carries_message() {
        tracing::debug!(kind = ?frame.kind, "Unexpected lifecycle frame mid-session");
        return;
    }
    let message: Message = match frame.decode() {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed message frame from parent");
            return;
        }
    };

    match message.kind {
        MessageKind::Put => state.coordinator.handle_parent_put(message),
        MessageKind::Ack => state.coordinator.handle_ack(message),
        MessageKind::Ping => {
            let pong = Message::pong(&state.local.id, state.local.clone());
            state.attach.send_via_parent(&pong);
        }
        MessageKind::Pong => {}
        MessageKind::Sync => {
            if let Some(info) = message.node_info {
                state.gossip.add_peer(info);
            }
        }
    }
}

async fn read_frame(ws: &mut WsStream) -> Option<Frame> {
    loop {
        match ws.next().await? {
            Ok(WsMessage::Text(text)) => match Frame::from_text(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable session frame; dropping");
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_frame(ws: &mut WsStream, frame: &Frame) -> Result<()> {
    let text = frame.to_text()?;
    ws.send(WsMessage::Text(text))
        .await
        .map_err(|e| Error::Session(e.to_string()))
}
