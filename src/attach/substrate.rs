//! src/attach/substrate.rs
//!
//! The substrate side of the attachment layer: accepts persistent sessions
//! on `/v1/ws` from transient peers, runs the hello/welcome handshake, and
//! keeps each attached child fed from the same gossip and coordinator
//! pipelines the mesh uses.

use crate::{
    api::AppState,
    attach::{
        frame::{
            AlternativeParent, Frame, FrameKind, GoodbyePayload, HelloPayload, SessionPosition,
            WelcomePayload,
        },
        session_channel, ChildSession, HEARTBEAT_INTERVAL, INBOUND_PROBE_TIMEOUT,
        MAX_GOODBYE_ALTERNATIVES, MAX_MISSED_PONGS,
    },
    config::InboundCapability,
    domain::{Message, MessageKind},
};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use std::time::Duration;
use tokio::{net::TcpStream, time};

/// How long the substrate waits for the opening hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// The handler for persistent-session upgrade requests.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_session(socket, state))
}

/// Builds up to five fallback substrates for a goodbye, preferring peers in
/// the child's enclave.
pub fn alternative_parents(state: &AppState, enclave: &str) -> Vec<AlternativeParent> {
    let mut peers = state.gossip.peers();
    peers.sort_by_key(|peer| peer.enclave != enclave);
    peers
        .into_iter()
        .take(MAX_GOODBYE_ALTERNATIVES)
        .map(|peer| AlternativeParent {
            id: peer.id,
            address: peer.address,
            http_port: peer.http_port,
            enclave: Some(peer.enclave),
        })
        .collect()
}

/// Sends every attached child a goodbye naming where to go next. Called on
/// graceful shutdown so children migrate instead of timing out.
pub fn send_shutdown_goodbyes(state: &AppState) {
    let children = state.attach.children();
    if children.is_empty() {
        return;
    }
    tracing::info!(count = children.len(), "Sending goodbye to attached children");
    for child in children {
        let goodbye = GoodbyePayload {
            reason: "shutting down".to_string(),
            alternative_parents: alternative_parents(state, &child.enclave),
        };
        match Frame::new(FrameKind::Goodbye, &goodbye, state.attach.cluster_secret()) {
            Ok(frame) => {
                child.send(frame);
            }
            Err(e) => tracing::error!(error = %e, "Failed to frame goodbye"),
        }
    }
}

async fn handle_session(mut socket: WebSocket, state: AppState) {
    // --- Handshake: the transient speaks first ---
    let hello = match time::timeout(HELLO_TIMEOUT, read_frame(&mut socket)).await {
        Ok(Some(frame)) if frame.kind == FrameKind::Hello => {
            if !frame.verify(state.attach.cluster_secret()) {
                tracing::warn!("Attachment hello failed signature verification; closing");
                return;
            }
            match frame.decode::<HelloPayload>() {
                Ok(hello) => hello,
                Err(e) => {
                    tracing::warn!(error = %e, "Malformed hello payload; closing");
                    return;
                }
            }
        }
        Ok(Some(frame)) => {
            tracing::warn!(kind = ?frame.kind, "Session opened without hello; closing");
            return;
        }
        _ => {
            tracing::debug!("Session closed before hello");
            return;
        }
    };

    let (tx, mut outbound_rx) = session_channel();
    let inbound_detected = match hello.capabilities.inbound {
        InboundCapability::True => true,
        InboundCapability::False => false,
        InboundCapability::Auto => probe_inbound(&hello.address, hello.http_port).await,
    };
    let child = ChildSession::new(
        hello.node_id.clone(),
        hello.enclave.clone(),
        hello.address.clone(),
        hello.http_port,
        inbound_detected,
        tx,
    );

    // At capacity (or attachments disabled): redirect and close.
    if state.attach.register_child(child).is_err() {
        let goodbye = GoodbyePayload {
            reason: "at capacity".to_string(),
            alternative_parents: alternative_parents(&state, &hello.enclave),
        };
        tracing::info!(child_id = %hello.node_id, "Redirecting attachment; at capacity");
        if let Ok(frame) = Frame::new(FrameKind::Goodbye, &goodbye, state.attach.cluster_secret())
        {
            send_frame(&mut socket, &frame).await;
        }
        return;
    }

    let welcome = WelcomePayload {
        topology: topology_snapshot(&state),
        your_position: SessionPosition {
            depth: 1,
            parent_id: state.local.id.clone(),
        },
        inbound_detected,
    };
    match Frame::new(FrameKind::Welcome, &welcome, state.attach.cluster_secret()) {
        Ok(frame) => {
            if !send_frame(&mut socket, &frame).await {
                state.attach.remove_child(&hello.node_id);
                return;
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to frame welcome");
            state.attach.remove_child(&hello.node_id);
            return;
        }
    }

    // --- Session loop ---
    let child_id = hello.node_id.clone();
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // Immediate first tick.
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            Some(frame) = outbound_rx.recv() => {
                let closing = frame.kind == FrameKind::Goodbye;
                if !send_frame(&mut socket, &frame).await {
                    break;
                }
                if closing {
                    break;
                }
            }
            inbound = read_frame(&mut socket) => {
                let Some(frame) = inbound else { break };
                if !frame.verify(state.attach.cluster_secret()) {
                    tracing::warn!(child_id = %child_id, "Dropping frame with bad signature");
                    continue;
                }
                match frame.kind {
                    FrameKind::Pong => missed_pongs = 0,
                    FrameKind::Goodbye => {
                        tracing::info!(child_id = %child_id, "Child said goodbye");
                        break;
                    }
                    _ => dispatch_child_frame(&state, &child_id, frame),
                }
            }
            _ = heartbeat.tick() => {
                if missed_pongs >= MAX_MISSED_PONGS {
                    tracing::warn!(child_id = %child_id, "Child missed heartbeats; terminating session");
                    break;
                }
                missed_pongs += 1;
                let ping = Message::ping(&state.local.id);
                match Frame::for_message(&ping, state.attach.cluster_secret()) {
                    Ok(frame) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to frame heartbeat"),
                }
            }
        }
    }

    state.attach.remove_child(&child_id);
}

/// Routes one inbound child frame into the shared pipelines.
fn dispatch_child_frame(state: &AppState, child_id: &str, frame: Frame) {
    if !frame.carries_message() {
        tracing::debug!(child_id = %child_id, kind = ?frame.kind, "Unexpected lifecycle frame mid-session");
        return;
    }
    let message: Message = match frame.decode() {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(child_id = %child_id, error = %e, "Malformed message frame");
            return;
        }
    };

    match message.kind {
        MessageKind::Put => state.coordinator.handle_child_put(message, child_id),
        MessageKind::Ack => state.coordinator.handle_ack(message),
        MessageKind::Ping => {
            let pong = Message::pong(&state.local.id, state.local.clone());
            state.attach.send_to_child(child_id, &pong);
        }
        MessageKind::Pong => {}
        MessageKind::Sync => {
            if let Some(info) = message.node_info {
                state.gossip.add_peer(info);
            }
        }
    }
}

/// One SYNC-style entry per known peer, plus ourselves, for the welcome.
fn topology_snapshot(state: &AppState) -> Vec<Message> {
    let mut entries: Vec<Message> = state
        .gossip
        .peers()
        .into_iter()
        .map(|peer| Message::sync(&state.local.id, peer))
        .collect();
    entries.push(Message::sync(&state.local.id, state.local.clone()));
    entries
}

/// Short TCP probe against the attaching peer's advertised HTTP port. A
/// connect within the timeout means the peer is inbound-capable.
async fn probe_inbound(address: &str, http_port: u16) -> bool {
    let target = format!("{address}:{http_port}");
    match time::timeout(INBOUND_PROBE_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(_)) => {
            tracing::debug!(target = %target, "Inbound probe succeeded");
            true
        }
        _ => {
            tracing::debug!(target = %target, "Inbound probe failed; peer is transient");
            false
        }
    }
}

async fn read_frame(socket: &mut WebSocket) -> Option<Frame> {
    loop {
        match socket.recv().await? {
            Ok(WsMessage::Text(text)) => match Frame::from_text(&text) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable session frame; dropping");
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue, // Binary/ping/pong at the WS layer are ignored.
            Err(_) => return None,
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    let text = match frame.to_text() {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize session frame");
            return false;
        }
    };
    socket.send(WsMessage::Text(text)).await.is_ok()
}
