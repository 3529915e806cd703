//! src/domain.rs
//!
//! Consolidates the core data structures of the protocol. This module is the
//! single source of truth for the application's domain model: node identity,
//! the gossip wire message, and the bootstrap handshake bodies.
//!
//! Wire field names are fixed by the cross-implementation protocol contract;
//! peers may be written in any language and HMAC signatures are computed over
//! the exact serialized bytes, so nothing here may be renamed.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// The identity a node advertises to the network. Stable per process start.
///
/// Two nodes with the same `enclave` are eligible to replicate each other's
/// data; nodes in different enclaves remain mutually visible for topology
/// discovery only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub id: String,
    pub address: String,
    #[serde(rename = "port")]
    pub gossip_port: u16,
    pub http_port: u16,
    #[serde(default = "default_enclave")]
    pub enclave: String,
}

pub fn default_enclave() -> String {
    "default".to_string()
}

impl NodeIdentity {
    /// Base URL of the peer's HTTP surface, which carries both the gossip
    /// wire and the bootstrap handshake.
    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.address, self.http_port)
    }

    /// URL of the peer's persistent-session endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/v1/ws", self.address, self.http_port)
    }

    pub fn same_enclave(&self, other: &NodeIdentity) -> bool {
        self.enclave == other.enclave
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.address, self.http_port)
    }
}

/// A known remote node, tracked in the gossip peer directory.
#[derive(Debug, Clone)]
pub struct Peer {
    pub identity: NodeIdentity,
    /// Consecutive health-check failures. Reset by any PONG; the peer is
    /// evicted at [`crate::gossip::MAX_PING_FAILURES`].
    pub ping_failures: u32,
}

impl Peer {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            ping_failures: 0,
        }
    }
}

/// Gossip message discriminator. Uppercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "ACK")]
    Ack,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "SYNC")]
    Sync,
}

/// The gossip wire object, exchanged as JSON over `/v1/gossip/message` and
/// inside attachment frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes",
        rename = "data"
    )]
    pub value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ttl")]
    pub ttl_seconds: Option<u64>,
    pub timestamp: u64,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info: Option<NodeIdentity>,
}

impl Message {
    fn base(kind: MessageKind, from: &str) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: String::new(),
            key: String::new(),
            value: None,
            ttl_seconds: None,
            timestamp: unix_now(),
            message_id: next_message_id(),
            node_info: None,
        }
    }

    /// A replication PUT carrying a value. An empty value is carried as an
    /// omitted `data` field.
    pub fn put(from: &str, key: &str, value: Vec<u8>, ttl_seconds: u64) -> Self {
        let mut msg = Self::base(MessageKind::Put, from);
        msg.key = key.to_string();
        msg.value = if value.is_empty() { None } else { Some(value) };
        msg.ttl_seconds = Some(ttl_seconds);
        msg
    }

    /// A replication confirmation addressed to the PUT's originator. Reuses
    /// the PUT's `message_id` so the originator can match it to the pending
    /// write.
    pub fn ack(from: &str, to: &str, message_id: &str) -> Self {
        let mut msg = Self::base(MessageKind::Ack, from);
        msg.to = to.to_string();
        msg.message_id = message_id.to_string();
        msg
    }

    pub fn ping(from: &str) -> Self {
        Self::base(MessageKind::Ping, from)
    }

    pub fn pong(from: &str, node_info: NodeIdentity) -> Self {
        let mut msg = Self::base(MessageKind::Pong, from);
        msg.node_info = Some(node_info);
        msg
    }

    /// A topology advertisement. `from` is the sending node; `node_info` is
    /// the node being advertised. The two differ when the SYNC is propagated
    /// on another node's behalf.
    pub fn sync(from: &str, node_info: NodeIdentity) -> Self {
        let mut msg = Self::base(MessageKind::Sync, from);
        msg.node_info = Some(node_info);
        msg
    }

    /// Whether a SYNC advertises its own sender. Only direct SYNCs trigger a
    /// topology response; propagated ones must not, or every exchange would
    /// amplify quadratically.
    pub fn is_direct_sync(&self) -> bool {
        self.kind == MessageKind::Sync
            && self
                .node_info
                .as_ref()
                .is_some_and(|info| info.id == self.from)
    }

    pub fn value_bytes(&self) -> &[u8] {
        self.value.as_deref().unwrap_or(&[])
    }
}

/// Body POSTed to a seed's `/v1/bootstrap` endpoint when joining.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapRequest {
    pub node_id: String,
    pub address: String,
    pub gossip_port: u16,
    pub http_port: u16,
    #[serde(default = "default_enclave")]
    pub enclave: String,
}

impl BootstrapRequest {
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            id: self.node_id.clone(),
            address: self.address.clone(),
            gossip_port: self.gossip_port,
            http_port: self.http_port,
            enclave: self.enclave.clone(),
        }
    }
}

/// The seed's current view of the network, returned from `/v1/bootstrap`.
/// Includes the seed itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapResponse {
    pub peers: Vec<NodeIdentity>,
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Produces a process-unique message id: `{nanos}-{counter}`. The counter
/// disambiguates ids minted within one clock tick.
pub fn next_message_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_nanos();
    let count = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{count}")
}

/// Generates a random node id for configs that leave `node_id` empty.
pub fn generate_node_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("node-{}", hex::encode(bytes))
}

mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&BASE64.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(text) => BASE64
                .decode(text.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// --- Unit Tests ---
