//! src/attach/frame.rs
//!
//! The attachment-session wire format. Every frame wraps either a gossip
//! message (`put`/`ack`/`ping`/`pong`/`topology_sync`) or a lifecycle payload
//! (`hello`/`welcome`/`goodbye`), with an optional hex HMAC-SHA256 signature
//! computed over the serialized payload.

use crate::{auth, config::InboundCapability, domain::Message, error::Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Frame discriminator. Lowercase on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Put,
    Ack,
    Ping,
    Pong,
    TopologySync,
    Hello,
    Welcome,
    Goodbye,
}

/// One framed unit on a persistent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub payload: Value,
}

impl Frame {
    /// Wraps any serializable payload, signing it when a secret is set.
    pub fn new<T: Serialize>(kind: FrameKind, payload: &T, secret: Option<&str>) -> Result<Self> {
        let payload = serde_json::to_value(payload)?;
        let signature = match secret {
            Some(secret) => {
                let bytes = serde_json::to_vec(&payload)?;
                Some(auth::sign(secret, &bytes))
            }
            None => None,
        };
        Ok(Self {
            kind,
            signature,
            payload,
        })
    }

    /// Wraps a gossip message under the matching frame kind.
    pub fn for_message(message: &Message, secret: Option<&str>) -> Result<Self> {
        let kind = match message.kind {
            crate::domain::MessageKind::Put => FrameKind::Put,
            crate::domain::MessageKind::Ack => FrameKind::Ack,
            crate::domain::MessageKind::Ping => FrameKind::Ping,
            crate::domain::MessageKind::Pong => FrameKind::Pong,
            crate::domain::MessageKind::Sync => FrameKind::TopologySync,
        };
        Self::new(kind, message, secret)
    }

    /// Checks the signature against the shared secret. With no secret
    /// configured every frame passes; with one configured, unsigned frames
    /// fail exactly like tampered ones.
    pub fn verify(&self, secret: Option<&str>) -> bool {
        let Some(secret) = secret else {
            return true;
        };
        let Some(signature) = &self.signature else {
            return false;
        };
        match serde_json::to_vec(&self.payload) {
            Ok(bytes) => auth::verify(secret, &bytes, signature),
            Err(_) => false,
        }
    }

    /// Decodes the payload into its typed form.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// True for the frame kinds that carry a gossip [`Message`] payload.
    pub fn carries_message(&self) -> bool {
        matches!(
            self.kind,
            FrameKind::Put
                | FrameKind::Ack
                | FrameKind::Ping
                | FrameKind::Pong
                | FrameKind::TopologySync
        )
    }
}

/// First frame on a session: the transient introduces itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub node_id: String,
    #[serde(default = "crate::domain::default_enclave")]
    pub enclave: String,
    pub address: String,
    pub http_port: u16,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub inbound: InboundCapability,
}

/// The substrate's acceptance: current topology plus the child's position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomePayload {
    /// One SYNC-style message per known peer, plus the substrate itself.
    pub topology: Vec<Message>,
    pub your_position: SessionPosition,
    pub inbound_detected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPosition {
    pub depth: u32,
    pub parent_id: String,
}

/// Session termination, with up to five places to go next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodbyePayload {
    pub reason: String,
    #[serde(default)]
    pub alternative_parents: Vec<AlternativeParent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeParent {
    pub id: String,
    pub address: String,
    pub http_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclave: Option<String>,
}
