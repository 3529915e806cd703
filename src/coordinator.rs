//! src/coordinator.rs
//!
//! The write coordinator. Gives clients the two-status contract — 201 once a
//! quorum of stores holds the value, 202 if the deadline passes first — and
//! drives replication on the receive side: dedup, local store, ACK to the
//! originator, epidemic forward, and relay handling for attached transient
//! peers.

use crate::{
    attach::AttachmentLayer,
    domain::{Message, NodeIdentity},
    error::{Error, Result},
    gossip::{protocol, Gossip},
    store::Store,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio::time;

/// How a write resolved, mapped by the shell to an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Quorum reached within the deadline → 201.
    Replicated,
    /// Deadline elapsed with the local store committed → 202.
    Accepted,
}

struct WriteOperation {
    confirmations: usize,
    quorum_needed: usize,
    done: oneshot::Sender<WriteOutcome>,
}

/// Coordinates client writes and inbound replication traffic.
pub struct Coordinator {
    local: NodeIdentity,
    store: Arc<Store>,
    gossip: Arc<Gossip>,
    attach: Arc<AttachmentLayer>,
    pending: Mutex<HashMap<String, WriteOperation>>,
    write_timeout: Duration,
    replication_factor: usize,
    stopped: AtomicBool,
}

impl Coordinator {
    pub fn new(
        local: NodeIdentity,
        store: Arc<Store>,
        gossip: Arc<Gossip>,
        attach: Arc<AttachmentLayer>,
        write_timeout: Duration,
        replication_factor: usize,
    ) -> Self {
        Self {
            local,
            store,
            gossip,
            attach,
            pending: Mutex::new(HashMap::new()),
            write_timeout,
            replication_factor,
            stopped: AtomicBool::new(false),
        }
    }

    /// Members of our enclave that can hold a replica: mesh peers, attached
    /// children, and ourselves. A child that also appears in the peer
    /// directory (its bootstrap POST landed before it attached) counts once.
    fn enclave_size(&self) -> usize {
        let peers = self.gossip.enclave_peers();
        let peer_ids: std::collections::HashSet<&str> =
            peers.iter().map(|p| p.id.as_str()).collect();
        let session_only_children = self
            .attach
            .children()
            .into_iter()
            .filter(|child| {
                child.enclave == self.local.enclave && !peer_ids.contains(child.id.as_str())
            })
            .count();
        peers.len() + session_only_children + 1
    }

    /// `floor(min(enclave_size, replication_factor) / 2) + 1`. At least 1, so
    /// a lone node confirms its own writes.
    fn quorum_needed(&self) -> usize {
        let replicas = self.enclave_size().min(self.replication_factor);
        (replicas / 2 + 1).max(1)
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.lock().expect("pending writes lock poisoned").len()
    }

    /// Client-initiated write: store locally, replicate into the enclave,
    /// and wait for quorum or the deadline.
    pub async fn put(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<WriteOutcome> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        self.store.put(key, value, ttl_seconds)?;

        let quorum_needed = self.quorum_needed();
        if quorum_needed <= 1 {
            return Ok(WriteOutcome::Replicated);
        }

        let message = Message::put(&self.local.id, key, value.to_vec(), ttl_seconds);
        let message_id = message.message_id.clone();
        // Our own id goes into the dedup cache up front so an echoed copy of
        // this PUT is a no-op instead of a self-ACK.
        self.gossip.mark_seen(&message_id);

        let (done, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending writes lock poisoned");
            pending.insert(
                message_id.clone(),
                WriteOperation {
                    confirmations: 1,
                    quorum_needed,
                    done,
                },
            );
        }

        self.replicate_out(&message);

        let outcome = tokio::select! {
            resolved = &mut rx => resolved.unwrap_or(WriteOutcome::Accepted),
            _ = time::sleep(self.write_timeout) => {
                // The deadline and a quorum ACK race; whoever removes the
                // entry under the lock wins, so a client never sees both.
                let timed_out = {
                    let mut pending =
                        self.pending.lock().expect("pending writes lock poisoned");
                    pending.remove(&message_id).is_some()
                };
                if timed_out {
                    tracing::debug!(message_id = %message_id, "Write deadline elapsed before quorum");
                    WriteOutcome::Accepted
                } else {
                    rx.await.unwrap_or(WriteOutcome::Accepted)
                }
            }
        };
        Ok(outcome)
    }

    /// Fans a locally-originated PUT out to every replica path we have:
    /// the parent session when attached, the mesh otherwise, plus any
    /// attached children in our enclave.
    fn replicate_out(&self, message: &Message) {
        if self.attach.send_via_parent(message) {
            tracing::debug!(message_id = %message.message_id, "Routed write via parent session");
        } else {
            self.gossip.broadcast(message, None);
        }
        self.attach
            .broadcast_to_children(message, &self.local.enclave, None);
    }

    /// Inbound PUT from the mesh: replicate locally and keep the epidemic
    /// moving.
    pub fn handle_remote_put(&self, message: Message) {
        if self.gossip.mark_seen(&message.message_id) {
            tracing::trace!(message_id = %message.message_id, "Duplicate PUT dropped");
            return;
        }
        let Some(ttl_seconds) = message.ttl_seconds else {
            tracing::warn!(from = %message.from, "PUT without ttl; dropping");
            return;
        };

        if let Err(e) = self
            .store
            .put(&message.key, message.value_bytes(), ttl_seconds)
        {
            tracing::warn!(key = %message.key, error = %e, "Replica store failed");
            return;
        }

        // Confirm to the originator.
        let ack = Message::ack(&self.local.id, &message.from, &message.message_id);
        self.gossip.send_to_id(&message.from, ack);

        // Epidemic forward. In a small enclave the originator already
        // reached everyone; only large enclaves need another hop.
        if self.gossip.enclave_peers().len() > protocol::BROADCAST_THRESHOLD {
            self.gossip.broadcast(&message, Some(&message.from));
        }

        // Attached children converge too.
        self.attach
            .broadcast_to_children(&message, &self.local.enclave, None);
    }

    /// Inbound PUT over an attachment session, from the attached child
    /// `child_id`. The substrate relays it into the mesh on the child's
    /// behalf.
    pub fn handle_child_put(&self, message: Message, child_id: &str) {
        if self.gossip.mark_seen(&message.message_id) {
            tracing::trace!(message_id = %message.message_id, "Duplicate child PUT dropped");
            return;
        }
        let Some(ttl_seconds) = message.ttl_seconds else {
            tracing::warn!(child_id = %child_id, "Child PUT without ttl; dropping");
            return;
        };

        if let Err(e) = self
            .store
            .put(&message.key, message.value_bytes(), ttl_seconds)
        {
            tracing::warn!(key = %message.key, error = %e, "Relay store failed");
            return;
        }

        // Mesh ACKs for this id must find their way back over the session.
        self.attach
            .record_ack_route(&message.message_id, child_id);

        // Our store is the child's first remote confirmation; ACK at once.
        let ack = Message::ack(&self.local.id, &message.from, &message.message_id);
        self.attach.send_to_child(child_id, &ack);

        // Relay into the mesh with `from` rewritten to us: the transient is
        // unreachable, so mesh ACKs must come here for reverse routing.
        let mut relayed = message.clone();
        relayed.from = self.local.id.clone();
        self.gossip.broadcast(&relayed, None);

        // Sibling broadcast keeps the original `from` so sibling ACKs are
        // addressed to the true originator.
        self.attach
            .broadcast_to_children(&message, &self.local.enclave, Some(child_id));
    }

    /// Inbound PUT down the parent session, on a transient node. Store and
    /// confirm back up the same socket; the parent handles all forwarding,
    /// and the reverse ACK route at the substrate carries our confirmation
    /// to the true originator.
    pub fn handle_parent_put(&self, message: Message) {
        if self.gossip.mark_seen(&message.message_id) {
            tracing::trace!(message_id = %message.message_id, "Duplicate session PUT dropped");
            return;
        }
        let Some(ttl_seconds) = message.ttl_seconds else {
            tracing::warn!(from = %message.from, "Session PUT without ttl; dropping");
            return;
        };

        if let Err(e) = self
            .store
            .put(&message.key, message.value_bytes(), ttl_seconds)
        {
            tracing::warn!(key = %message.key, error = %e, "Session replica store failed");
            return;
        }

        let ack = Message::ack(&self.local.id, &message.from, &message.message_id);
        self.attach.send_via_parent(&ack);
    }

    /// Inbound ACK, from the mesh or from a session. Relay routes win over
    /// local pending writes: a substrate forwarding for a child is not
    /// tracking that child's quorum.
    pub fn handle_ack(&self, message: Message) {
        if let Some(child_id) = self.attach.ack_route(&message.message_id) {
            if self.attach.send_to_child(&child_id, &message) {
                tracing::trace!(
                    message_id = %message.message_id,
                    child_id = %child_id,
                    "Reverse-routed ACK to attached child"
                );
            }
            return;
        }

        let mut pending = self.pending.lock().expect("pending writes lock poisoned");
        let Some(operation) = pending.get_mut(&message.message_id) else {
            tracing::trace!(message_id = %message.message_id, "ACK for unknown write; ignoring");
            return;
        };
        operation.confirmations += 1;
        if operation.confirmations >= operation.quorum_needed {
            let operation = pending
                .remove(&message.message_id)
                .expect("entry present under lock");
            let _ = operation.done.send(WriteOutcome::Replicated);
        }
    }

    /// Resolves every pending write as 202 and rejects future writes.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let drained: Vec<WriteOperation> = {
            let mut pending = self.pending.lock().expect("pending writes lock poisoned");
            pending.drain().map(|(_, op)| op).collect()
        };
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "Resolving in-flight writes as accepted");
        }
        for operation in drained {
            let _ = operation.done.send(WriteOutcome::Accepted);
        }
    }
}

// --- Unit Tests ---
