//! src/api/mod.rs
//!
//! The HTTP surface: the client data plane, cluster metadata, the signed
//! gossip and bootstrap endpoints, and the persistent-session upgrade. Thin
//! by design; everything interesting happens in the components it routes to.

use crate::{
    attach::{substrate, AttachmentLayer},
    config::Config,
    coordinator::Coordinator,
    domain::NodeIdentity,
    error::Error,
    gossip::Gossip,
    store::Store,
};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod cluster;
pub mod data;
pub mod ratelimit;

/// The shared state accessible by all Axum handlers and session loops.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub local: NodeIdentity,
    pub store: Arc<Store>,
    pub gossip: Arc<Gossip>,
    pub coordinator: Arc<Coordinator>,
    pub attach: Arc<AttachmentLayer>,
    pub rate_limiter: Arc<ratelimit::RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Builds the full router. Client-facing data routes sit behind the rate
/// limiter; node-to-node routes do not, so replication cannot starve behind
/// a client's budget.
pub fn router(state: AppState) -> Router {
    let data_routes = Router::new()
        .route(
            "/v1/data/:key",
            put(data::put_value).get(data::get_value),
        )
        .route("/v1/keys", get(data::list_keys))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::limit,
        ));

    Router::new()
        .merge(data_routes)
        .route("/v1/health", get(cluster::health))
        .route("/v1/status", get(cluster::status))
        .route("/v1/topology", get(cluster::topology))
        .route("/v1/gossip/message", post(cluster::gossip_message))
        .route("/v1/bootstrap", post(cluster::bootstrap))
        .route("/v1/ws", get(substrate::ws_handler))
        // Backstop body cap; the data handler enforces the precise value
        // limit itself. Base64 framing on the gossip path needs headroom.
        .layer(DefaultBodyLimit::max(state.config.max_value_bytes * 2 + 4096))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The HTTP server service.
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: AppState,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, state: AppState) -> Self {
        Self { bind_addr, state }
    }

    pub async fn run(self, shutdown_token: CancellationToken) -> crate::error::Result<()> {
        let app = router(self.state);

        tracing::info!(listen_addr = %self.bind_addr, "HTTP server listening");
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown_token.cancelled().await;
            tracing::info!("HTTP server received shutdown signal.");
        })
        .await?;

        Ok(())
    }
}

/// Maps component errors onto the HTTP contract.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::StoreFull => StatusCode::INSUFFICIENT_STORAGE,
            Error::Oversized => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::AuthFailed => StatusCode::FORBIDDEN,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }
        response
    }
}
