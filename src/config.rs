//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Whether this node can accept inbound connections, as declared by the
/// operator. `Auto` defers to detection by the remote side during the
/// attachment handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundCapability {
    Auto,
    True,
    False,
}

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Stable identifier for this node. Empty means "generate one at startup".
    pub node_id: String,
    /// Address this node advertises to peers.
    pub address: String,
    pub http_port: u16,
    pub gossip_port: u16,
    /// Replication membership tag. Only nodes sharing an enclave replicate
    /// each other's data.
    pub enclave: String,
    pub replication_factor: usize,
    /// TTL clamp bounds applied by the HTTP shell, in seconds.
    pub min_ttl: u64,
    pub max_ttl: u64,
    /// How long a write waits for quorum before resolving 202, in seconds.
    pub write_timeout: u64,
    /// Shared secret for HMAC signing of gossip and bootstrap traffic.
    /// Empty disables signing.
    pub cluster_secret: String,
    /// Total value-byte cap for the store. 0 disables the cap.
    pub max_storage_bytes: u64,
    /// Largest accepted request body, in bytes.
    pub max_value_bytes: usize,
    /// Client requests per second per IP. 0 disables rate limiting.
    pub rate_limit: u32,
    /// Honor X-Forwarded-For when identifying rate-limit clients.
    pub trust_proxy: bool,
    pub inbound: InboundCapability,
    /// Maximum attached transient children. 0 means never accept attachments.
    pub max_children: usize,
    pub log_level: String,
    /// Static seed list, `host:port` pairs tried in order before any
    /// DNS-discovered seeds.
    pub bootstrap_peers: Vec<String>,
    /// DNS name resolved (SRV, then A/AAAA) to find bootstrap seeds.
    /// Empty skips DNS bootstrap.
    pub bootstrap_host: String,
    /// Port assumed for seeds found via A/AAAA fallback.
    pub bootstrap_port: u16,
}

impl Config {
    /// Loads configuration from `repram.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("repram.toml"))
            .merge(Env::prefixed("REPRAM_"))
            .extract()
    }

    pub fn write_timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.write_timeout)
    }

    /// Clamps a requested TTL into the configured window.
    pub fn clamp_ttl(&self, requested: u64) -> u64 {
        requested.clamp(self.min_ttl, self.max_ttl)
    }

    pub fn cluster_secret(&self) -> Option<&str> {
        if self.cluster_secret.is_empty() {
            None
        } else {
            Some(&self.cluster_secret)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            address: "127.0.0.1".to_string(),
            http_port: 8080,
            gossip_port: 9090,
            enclave: "default".to_string(),
            replication_factor: 3,
            min_ttl: 300,
            max_ttl: 86400,
            write_timeout: 5,
            cluster_secret: String::new(),
            max_storage_bytes: 0,
            max_value_bytes: 1024 * 1024,
            rate_limit: 0,
            trust_proxy: false,
            inbound: InboundCapability::Auto,
            max_children: 0,
            log_level: "info".to_string(),
            bootstrap_peers: Vec::new(),
            bootstrap_host: String::new(),
            bootstrap_port: 8080,
        }
    }
}
