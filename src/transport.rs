//! src/transport.rs
//!
//! The outbound half of the wire: deliver one `Message` to one peer.
//!
//! Delivery is best-effort. Failures are reported to the caller as
//! [`Error::PeerUnreachable`] so the gossip layer can count them toward a
//! peer's health tally, but they are never surfaced to clients.

use crate::{
    auth,
    domain::{Message, NodeIdentity},
    error::{Error, Result},
};
use futures::future::BoxFuture;
use std::time::Duration;

/// Per-send timeout. A peer that cannot take a message in this window counts
/// as unreachable for that round.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can deliver a gossip message to a peer.
///
/// The mesh uses [`HttpTransport`]; the attachment layer provides a session
/// transport for peers reachable only through a persistent session. The
/// gossip and coordinator layers do not care which.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, to: &'a NodeIdentity, message: &'a Message)
        -> BoxFuture<'a, Result<()>>;
}

/// Delivers messages by POSTing the wire JSON to the peer's
/// `/v1/gossip/message` endpoint, optionally HMAC-signed.
pub struct HttpTransport {
    client: reqwest::Client,
    cluster_secret: Option<String>,
}

impl HttpTransport {
    pub fn new(cluster_secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            client,
            cluster_secret,
        }
    }
}

impl Transport for HttpTransport {
    fn send<'a>(
        &'a self,
        to: &'a NodeIdentity,
        message: &'a Message,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            // The signature is over the exact bytes we put on the wire, so
            // serialize once and send those bytes verbatim.
            let body = serde_json::to_vec(message)?;

            let url = format!("{}/v1/gossip/message", to.http_base());
            let mut request = self
                .client
                .post(&url)
                .header("content-type", "application/json");
            if let Some(secret) = &self.cluster_secret {
                request = request.header(auth::SIGNATURE_HEADER, auth::sign(secret, &body));
            }

            let response = request
                .body(body)
                .send()
                .await
                .map_err(|e| Error::PeerUnreachable(to.id.clone(), e.to_string()))?;

            if !response.status().is_success() {
                return Err(Error::PeerUnreachable(
                    to.id.clone(),
                    format!("HTTP {}", response.status()),
                ));
            }
            tracing::trace!(peer = %to, kind = ?message.kind, "Delivered message");
            Ok(())
        })
    }
}
