//! src/attach/mod.rs
//!
//! State for the attachment layer: the substrate's registry of attached
//! transient children, the reverse ACK route table, and (on the transient
//! side) the handle to the current parent session.
//!
//! The session loops themselves live in [`substrate`] (inbound, off the
//! `/v1/ws` endpoint) and [`transient`] (outbound, via tokio-tungstenite).

use crate::{attach::frame::Frame, domain::Message, error::Result};
use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod frame;
pub mod substrate;
pub mod transient;

/// Session heartbeat cadence, both directions.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Missed pongs before a session is terminated.
pub const MAX_MISSED_PONGS: u32 = 3;
/// Cap on alternative substrates offered in a goodbye.
pub const MAX_GOODBYE_ALTERNATIVES: usize = 5;
/// Timeout for the inbound-capability TCP probe during handshake.
pub const INBOUND_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// Cadence of expired ACK-route cleanup.
const ROUTE_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// A registered attached child, as seen by the substrate.
#[derive(Debug, Clone)]
pub struct ChildSession {
    pub id: String,
    pub enclave: String,
    pub address: String,
    pub http_port: u16,
    pub inbound_detected: bool,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ChildSession {
    pub fn new(
        id: String,
        enclave: String,
        address: String,
        http_port: u16,
        inbound_detected: bool,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            enclave,
            address,
            http_port,
            inbound_detected,
            tx,
        }
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// The transient side's handle to its parent substrate.
#[derive(Debug, Clone)]
pub struct ParentHandle {
    pub id: String,
    tx: mpsc::UnboundedSender<Frame>,
}

impl ParentHandle {
    pub fn new(id: String, tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { id, tx }
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

struct AckRoute {
    child_id: String,
    expires_at: Instant,
}

/// Shared attachment state. Owned by the application root; consulted by the
/// coordinator for relay routing and by the session loops for registration.
pub struct AttachmentLayer {
    cluster_secret: Option<String>,
    max_children: usize,
    /// How long a relay ACK route stays alive: the write timeout, after
    /// which no pending write could still be waiting on it.
    route_ttl: Duration,
    children: Mutex<HashMap<String, ChildSession>>,
    ack_routes: Mutex<HashMap<String, AckRoute>>,
    parent: RwLock<Option<ParentHandle>>,
}

impl AttachmentLayer {
    pub fn new(cluster_secret: Option<String>, max_children: usize, route_ttl: Duration) -> Self {
        Self {
            cluster_secret,
            max_children,
            route_ttl,
            children: Mutex::new(HashMap::new()),
            ack_routes: Mutex::new(HashMap::new()),
            parent: RwLock::new(None),
        }
    }

    pub fn cluster_secret(&self) -> Option<&str> {
        self.cluster_secret.as_deref()
    }

    // --- Child registry (substrate side) ---

    /// Registers an attached child. `Err` carries no detail: the caller
    /// answers with a goodbye-and-redirect either way.
    pub fn register_child(&self, child: ChildSession) -> Result<(), ChildSession> {
        let mut children = self.children.lock().expect("child registry lock poisoned");
        if self.max_children == 0 || children.len() >= self.max_children {
            return Err(child);
        }
        tracing::info!(child_id = %child.id, enclave = %child.enclave, "Transient attached");
        children.insert(child.id.clone(), child);
        Ok(())
    }

    pub fn remove_child(&self, id: &str) {
        let mut children = self.children.lock().expect("child registry lock poisoned");
        if children.remove(id).is_some() {
            tracing::info!(child_id = %id, "Transient detached");
        }
    }

    pub fn child(&self, id: &str) -> Option<ChildSession> {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn children(&self) -> Vec<ChildSession> {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.children.lock().expect("child registry lock poisoned").len()
    }

    pub fn enclave_child_count(&self, enclave: &str) -> usize {
        self.children
            .lock()
            .expect("child registry lock poisoned")
            .values()
            .filter(|c| c.enclave == enclave)
            .count()
    }

    /// Pushes a gossip message to every attached child in `enclave`, except
    /// `exclude` (the child it came from, on the sibling-broadcast path).
    /// Returns how many children it reached.
    pub fn broadcast_to_children(
        &self,
        message: &Message,
        enclave: &str,
        exclude: Option<&str>,
    ) -> usize {
        let children = self.children.lock().expect("child registry lock poisoned");
        let mut sent = 0;
        for child in children.values() {
            if child.enclave != enclave {
                continue;
            }
            if exclude.is_some_and(|id| id == child.id) {
                continue;
            }
            match Frame::for_message(message, self.cluster_secret()) {
                Ok(frame) => {
                    if child.send(frame) {
                        sent += 1;
                    }
                }
                Err(e) => tracing::error!(error = %e, "Failed to frame message for child"),
            }
        }
        sent
    }

    pub fn send_to_child(&self, child_id: &str, message: &Message) -> bool {
        let Some(child) = self.child(child_id) else {
            return false;
        };
        match Frame::for_message(message, self.cluster_secret()) {
            Ok(frame) => child.send(frame),
            Err(e) => {
                tracing::error!(error = %e, "Failed to frame message for child");
                false
            }
        }
    }

    // --- Reverse ACK routes (substrate side) ---

    /// Remembers which child originated a relayed PUT, so mesh ACKs can be
    /// routed back over the session. Entries expire on the write timeout and
    /// are not consumed by a forward: several peers may ACK the same id.
    pub fn record_ack_route(&self, message_id: &str, child_id: &str) {
        let mut routes = self.ack_routes.lock().expect("ack route lock poisoned");
        routes.insert(
            message_id.to_string(),
            AckRoute {
                child_id: child_id.to_string(),
                expires_at: Instant::now() + self.route_ttl,
            },
        );
    }

    pub fn ack_route(&self, message_id: &str) -> Option<String> {
        let routes = self.ack_routes.lock().expect("ack route lock poisoned");
        routes
            .get(message_id)
            .filter(|route| route.expires_at > Instant::now())
            .map(|route| route.child_id.clone())
    }

    fn purge_expired_routes(&self) -> usize {
        let now = Instant::now();
        let mut routes = self.ack_routes.lock().expect("ack route lock poisoned");
        let before = routes.len();
        routes.retain(|_, route| route.expires_at > now);
        before - routes.len()
    }

    /// Background cleanup so stale routes cannot leak.
    pub async fn run_route_cleaner(
        self: std::sync::Arc<Self>,
        shutdown_token: CancellationToken,
    ) {
        let mut timer = tokio::time::interval(ROUTE_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = timer.tick() => {
                    let purged = self.purge_expired_routes();
                    if purged > 0 {
                        tracing::trace!(count = purged, "Purged expired ACK routes");
                    }
                }
            }
        }
    }

    // --- Parent handle (transient side) ---

    pub fn set_parent(&self, parent: ParentHandle) {
        let mut slot = self.parent.write().expect("parent lock poisoned");
        tracing::info!(parent_id = %parent.id, "Attached to substrate");
        *slot = Some(parent);
    }

    pub fn clear_parent(&self, id: &str) {
        let mut slot = self.parent.write().expect("parent lock poisoned");
        if slot.as_ref().is_some_and(|p| p.id == id) {
            *slot = None;
        }
    }

    pub fn parent(&self) -> Option<ParentHandle> {
        self.parent.read().expect("parent lock poisoned").clone()
    }

    /// Sends a gossip message up the parent session, if attached. The write
    /// path uses this instead of mesh broadcast on transient nodes.
    pub fn send_via_parent(&self, message: &Message) -> bool {
        let Some(parent) = self.parent() else {
            return false;
        };
        match Frame::for_message(message, self.cluster_secret()) {
            Ok(frame) => parent.send(frame),
            Err(e) => {
                tracing::error!(error = %e, "Failed to frame message for parent");
                false
            }
        }
    }
}

/// Creates the channel pair backing one session: the registry-facing sender
/// and the socket-facing receiver.
pub fn session_channel() -> (mpsc::UnboundedSender<Frame>, mpsc::UnboundedReceiver<Frame>) {
    mpsc::unbounded_channel()
}

// --- Unit Tests ---
