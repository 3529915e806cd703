//! src/api/cluster.rs
//!
//! Node-to-node and operational endpoints: health, status, topology, the
//! gossip wire inlet, and the bootstrap handshake. The signed endpoints
//! verify the HMAC over the raw body bytes before anything is parsed.

use crate::{
    api::{ApiError, AppState},
    auth,
    domain::{BootstrapRequest, BootstrapResponse, Message, MessageKind, NodeIdentity},
    error::Error,
    store::StoreStats,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use serde::Serialize;

fn verify_signed(secret: Option<&str>, headers: &HeaderMap, body: &[u8]) -> Result<(), Error> {
    let Some(secret) = secret else {
        return Ok(());
    };
    let signature = headers
        .get(auth::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::AuthFailed)?;
    if auth::verify(secret, body, signature) {
        Ok(())
    } else {
        Err(Error::AuthFailed)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_seconds: u64,
}

/// `GET /v1/health` — liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        node_id: state.local.id.clone(),
        uptime_seconds: state.uptime_seconds(),
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub address: String,
    pub http_port: u16,
    pub gossip_port: u16,
    pub enclave: String,
    pub peer_count: usize,
    pub child_count: usize,
    pub pending_writes: usize,
    pub store: StoreStats,
    pub uptime_seconds: u64,
}

/// `GET /v1/status` — one-page node summary.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        node_id: state.local.id.clone(),
        address: state.local.address.clone(),
        http_port: state.local.http_port,
        gossip_port: state.local.gossip_port,
        enclave: state.local.enclave.clone(),
        peer_count: state.gossip.peer_count(),
        child_count: state.attach.child_count(),
        pending_writes: state.coordinator.pending_writes(),
        store: state.store.stats(),
        uptime_seconds: state.uptime_seconds(),
    })
}

#[derive(Debug, Serialize)]
pub struct TopologyResponse {
    #[serde(rename = "self")]
    pub this_node: NodeIdentity,
    pub peers: Vec<NodeIdentity>,
    pub children: Vec<String>,
}

/// `GET /v1/topology` — who this node can see.
pub async fn topology(State(state): State<AppState>) -> Json<TopologyResponse> {
    Json(TopologyResponse {
        this_node: state.local.clone(),
        peers: state.gossip.peers(),
        children: state
            .attach
            .children()
            .into_iter()
            .map(|child| child.id)
            .collect(),
    })
}

/// `POST /v1/gossip/message` — the wire inlet. Verifies the signature when a
/// cluster secret is configured, then routes by message kind: data-plane
/// traffic to the coordinator, control traffic to gossip.
pub async fn gossip_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    verify_signed(state.config.cluster_secret(), &headers, &body)?;

    let message: Message = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed message: {e}")))?;

    match message.kind {
        MessageKind::Put => state.coordinator.handle_remote_put(message),
        MessageKind::Ack => state.coordinator.handle_ack(message),
        MessageKind::Ping | MessageKind::Pong | MessageKind::Sync => {
            state.gossip.handle_control(message)
        }
    }
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// `POST /v1/bootstrap` — the join handshake. Adds the requester to the
/// directory and returns our full view, ourselves included. Convergence
/// beyond that is topology sync's job.
pub async fn bootstrap(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BootstrapResponse>, ApiError> {
    verify_signed(state.config.cluster_secret(), &headers, &body)?;

    let request: BootstrapRequest = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("malformed bootstrap request: {e}")))?;

    let requester = request.identity();
    tracing::info!(peer = %requester, "Bootstrap request");
    state.gossip.add_peer(requester);

    let mut peers = state.gossip.peers();
    peers.push(state.local.clone());
    Ok(Json(BootstrapResponse { peers }))
}
