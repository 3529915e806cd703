//! src/gossip/mod.rs
//!
//! The gossip layer: the live peer directory, message deduplication, and the
//! periodic health-check and topology-sync rounds. PUT and ACK traffic is the
//! coordinator's business; this layer handles everything else on the wire and
//! decides who a broadcast reaches.

use crate::{
    domain::{Message, MessageKind, NodeIdentity, Peer},
    transport::Transport,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio::time;
use tokio_util::sync::CancellationToken;

pub mod protocol;

/// Cadence of PING rounds against the whole directory.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Cadence of SYNC rounds while the directory is under-populated.
pub const TOPOLOGY_SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failed health checks before a peer is evicted.
pub const MAX_PING_FAILURES: u32 = 3;
/// How long an observed message id suppresses duplicates.
pub const SEEN_TTL: Duration = Duration::from_secs(60);
/// Hard bound on the dedup cache.
pub const SEEN_CAPACITY: usize = 100_000;

/// Bounded map of recently-observed message ids.
///
/// Overflow first purges expired entries; if still over capacity, the older
/// half (by expiry) is dropped so the cache never grows past its bound even
/// under a flood of fresh ids.
pub struct SeenMessageCache {
    entries: HashMap<String, Instant>,
    ttl: Duration,
    capacity: usize,
}

impl SeenMessageCache {
    pub fn new() -> Self {
        Self::with_limits(SEEN_TTL, SEEN_CAPACITY)
    }

    pub fn with_limits(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity,
        }
    }

    /// Returns true if `message_id` was already cached (and unexpired);
    /// otherwise records it and returns false.
    pub fn mark_seen(&mut self, message_id: &str) -> bool {
        let now = Instant::now();
        if let Some(expiry) = self.entries.get(message_id) {
            if *expiry > now {
                return true;
            }
        }

        self.entries
            .insert(message_id.to_string(), now + self.ttl);
        if self.entries.len() > self.capacity {
            self.shrink(now);
        }
        false
    }

    fn shrink(&mut self, now: Instant) {
        self.entries.retain(|_, expiry| *expiry > now);
        if self.entries.len() <= self.capacity {
            return;
        }

        let mut by_expiry: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(id, expiry)| (id.clone(), *expiry))
            .collect();
        by_expiry.sort_by_key(|(_, expiry)| *expiry);
        for (id, _) in by_expiry.iter().take(by_expiry.len() / 2) {
            self.entries.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenMessageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The gossip service: peer directory plus routing.
pub struct Gossip {
    local: NodeIdentity,
    replication_factor: usize,
    transport: Arc<dyn Transport>,
    peers: RwLock<HashMap<String, Peer>>,
    seen: Mutex<SeenMessageCache>,
}

impl Gossip {
    pub fn new(
        local: NodeIdentity,
        replication_factor: usize,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local,
            replication_factor,
            transport,
            peers: RwLock::new(HashMap::new()),
            seen: Mutex::new(SeenMessageCache::new()),
        }
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.local
    }

    // --- Peer directory ---

    /// Adds or refreshes a peer. Idempotent; re-adding resets the failure
    /// counter and picks up address or enclave changes. Self is ignored.
    pub fn add_peer(&self, identity: NodeIdentity) {
        if identity.id == self.local.id {
            return;
        }
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        match peers.get_mut(&identity.id) {
            Some(peer) => {
                peer.ping_failures = 0;
                if peer.identity != identity {
                    tracing::debug!(peer = %identity, "Updated peer record");
                    peer.identity = identity;
                }
            }
            None => {
                tracing::info!(peer = %identity, "Discovered new peer");
                peers.insert(identity.id.clone(), Peer::new(identity));
            }
        }
    }

    pub fn remove_peer(&self, id: &str) {
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        if peers.remove(id).is_some() {
            tracing::info!(peer_id = %id, "Removed peer from directory");
        }
    }

    pub fn peer(&self, id: &str) -> Option<NodeIdentity> {
        let peers = self.peers.read().expect("peer directory lock poisoned");
        peers.get(id).map(|p| p.identity.clone())
    }

    /// Snapshot of every known peer, across all enclaves.
    pub fn peers(&self) -> Vec<NodeIdentity> {
        let peers = self.peers.read().expect("peer directory lock poisoned");
        peers.values().map(|p| p.identity.clone()).collect()
    }

    /// Snapshot of the peers eligible for replication: same enclave as us.
    pub fn enclave_peers(&self) -> Vec<NodeIdentity> {
        let peers = self.peers.read().expect("peer directory lock poisoned");
        peers
            .values()
            .filter(|p| p.identity.same_enclave(&self.local))
            .map(|p| p.identity.clone())
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peer directory lock poisoned").len()
    }

    // --- Dedup ---

    /// Records a message id; true means "already seen, drop it".
    pub fn mark_seen(&self, message_id: &str) -> bool {
        self.seen
            .lock()
            .expect("seen cache lock poisoned")
            .mark_seen(message_id)
    }

    // --- Sending ---

    pub async fn send_to(&self, to: &NodeIdentity, message: &Message) -> crate::error::Result<()> {
        self.transport.send(to, message).await
    }

    /// Fire-and-forget send to a peer known only by id. Unknown ids are
    /// dropped with a trace; the reply path for PINGs from strangers.
    pub fn send_to_id(&self, peer_id: &str, message: Message) {
        let Some(identity) = self.peer(peer_id) else {
            tracing::trace!(peer_id = %peer_id, "No directory entry; dropping outbound message");
            return;
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&identity, &message).await {
                tracing::debug!(peer = %identity, error = %e, "Send failed");
            }
        });
    }

    /// Sends a message into the enclave with the probabilistic fanout rule:
    /// full broadcast at or below the threshold, a `ceil(sqrt(n))` random
    /// sample above it. Returns how many peers were targeted.
    pub fn broadcast(&self, message: &Message, exclude: Option<&str>) -> usize {
        let candidates = self.enclave_peers();
        let selected = protocol::select_fanout(&candidates, exclude);
        let count = selected.len();

        for peer in selected {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.send(&peer, &message).await {
                    tracing::debug!(peer = %peer, error = %e, "Broadcast send failed");
                }
            });
        }
        count
    }

    // --- Control-plane dispatch (PING / PONG / SYNC) ---

    /// Handles a control message. PUT and ACK never reach this function; the
    /// shell routes those to the coordinator.
    pub fn handle_control(&self, message: Message) {
        match message.kind {
            MessageKind::Ping => {
                let pong = Message::pong(&self.local.id, self.local.clone());
                self.send_to_id(&message.from, pong);
            }
            MessageKind::Pong => self.handle_pong(&message),
            MessageKind::Sync => self.handle_sync(&message),
            MessageKind::Put | MessageKind::Ack => {
                tracing::warn!(kind = ?message.kind, "Data-plane message routed to gossip control; dropping");
            }
        }
    }

    fn handle_pong(&self, message: &Message) {
        let mut peers = self.peers.write().expect("peer directory lock poisoned");
        if let Some(peer) = peers.get_mut(&message.from) {
            peer.ping_failures = 0;
            if let Some(info) = &message.node_info {
                if info.id == peer.identity.id && info.enclave != peer.identity.enclave {
                    tracing::debug!(peer = %info, "Peer enclave updated via PONG");
                    peer.identity.enclave = info.enclave.clone();
                }
            }
        }
    }

    fn handle_sync(&self, message: &Message) {
        let Some(info) = message.node_info.clone() else {
            tracing::debug!(from = %message.from, "SYNC without node_info; dropping");
            return;
        };

        let respond = message.is_direct_sync();
        self.add_peer(info);

        // Only a direct SYNC (sender advertising itself) earns a topology
        // response. Propagated SYNCs must stay silent or every round of
        // gossip would amplify quadratically.
        if !respond {
            return;
        }

        let mut known = self.peers();
        known.retain(|peer| peer.id != message.from);
        known.push(self.local.clone());
        for identity in known {
            let sync = Message::sync(&self.local.id, identity);
            self.send_to_id(&message.from, sync);
        }
    }

    // --- Periodic rounds ---

    /// One PING round over the whole directory. Unreachable peers accumulate
    /// strikes and are evicted at the limit.
    pub async fn health_check_round(&self) {
        let targets = self.peers();
        if targets.is_empty() {
            return;
        }

        let ping = Message::ping(&self.local.id);
        let sends = targets.iter().map(|peer| {
            let transport = self.transport.clone();
            let ping = ping.clone();
            async move { (peer.id.clone(), transport.send(peer, &ping).await) }
        });

        for (peer_id, result) in futures::future::join_all(sends).await {
            if result.is_ok() {
                continue;
            }
            let mut peers = self.peers.write().expect("peer directory lock poisoned");
            if let Some(peer) = peers.get_mut(&peer_id) {
                peer.ping_failures += 1;
                tracing::debug!(
                    peer_id = %peer_id,
                    failures = peer.ping_failures,
                    "Health check failed"
                );
                if peer.ping_failures >= MAX_PING_FAILURES {
                    tracing::warn!(peer_id = %peer_id, "Evicting unresponsive peer");
                    peers.remove(&peer_id);
                }
            }
        }
    }

    /// One topology round: while the directory holds fewer peers than the
    /// replication factor needs, advertise ourselves to everyone we know and
    /// let the direct-SYNC responses fill in the gaps.
    pub async fn topology_sync_round(&self) {
        if self.peer_count() >= self.replication_factor.saturating_sub(1) {
            return;
        }

        for peer in self.peers() {
            let sync = Message::sync(&self.local.id, self.local.clone());
            if let Err(e) = self.transport.send(&peer, &sync).await {
                tracing::debug!(peer = %peer, error = %e, "Topology sync send failed");
            }
        }
    }

    /// Background service driving the periodic rounds.
    pub async fn run(self: Arc<Self>, shutdown_token: CancellationToken) {
        tracing::info!(node_id = %self.local.id, "Gossip service started");
        let mut health_timer = time::interval(HEALTH_CHECK_INTERVAL);
        let mut sync_timer = time::interval(TOPOLOGY_SYNC_INTERVAL);
        // The first tick of an interval fires immediately; skip it so a
        // freshly-bootstrapped directory is not health-checked before the
        // node finishes starting.
        health_timer.tick().await;
        sync_timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    tracing::info!("Gossip service received shutdown signal.");
                    break;
                }
                _ = health_timer.tick() => {
                    self.health_check_round().await;
                }
                _ = sync_timer.tick() => {
                    self.topology_sync_round().await;
                }
            }
        }
    }
}

// --- Unit Tests ---
