//! src/bootstrap.rs
//!
//! Joining the network: resolve the bootstrap hostname to a seed list (SRV
//! first, A/AAAA fallback), then hand our identity to seeds in order until
//! one answers with its view of the topology. An empty seed list is not an
//! error; the node simply starts as the first member.

use crate::{
    auth,
    domain::{BootstrapRequest, BootstrapResponse, NodeIdentity},
    error::{Error, Result},
    gossip::Gossip,
};
use hickory_resolver::TokioAsyncResolver;
use std::time::Duration;
use tokio::time;

/// Timeout for one `/v1/bootstrap` POST.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Attempts made by the fire-and-forget presence notification.
const NOTIFY_ATTEMPTS: u32 = 3;

/// One candidate seed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedAddr {
    pub host: String,
    pub port: u16,
}

impl SeedAddr {
    fn bootstrap_url(&self) -> String {
        format!("http://{}:{}/v1/bootstrap", self.host, self.port)
    }

    /// Parses a configured `host:port` seed entry.
    pub fn parse(entry: &str) -> Option<Self> {
        let (host, port) = entry.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// The network-join helper. Owns its own HTTP client; DNS is resolved with
/// the system configuration.
pub struct Bootstrap {
    client: reqwest::Client,
    cluster_secret: Option<String>,
}

impl Bootstrap {
    pub fn new(cluster_secret: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(JOIN_TIMEOUT)
            .build()
            .expect("reqwest client construction is infallible with static options");
        Self {
            client,
            cluster_secret,
        }
    }

    /// Resolves the configured bootstrap hostname into seed addresses.
    ///
    /// SRV records under `_gossip._tcp.{host}` take precedence and carry
    /// their own ports; otherwise A/AAAA records are used with
    /// `fallback_port`. Resolution failure on both paths yields an empty
    /// list — the caller starts as the first member.
    pub async fn resolve_seeds(&self, host: &str, fallback_port: u16) -> Vec<SeedAddr> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                tracing::warn!(error = %e, "System DNS configuration unavailable; skipping DNS bootstrap");
                return Vec::new();
            }
        };

        let srv_name = format!("_gossip._tcp.{host}");
        match resolver.srv_lookup(srv_name.clone()).await {
            Ok(records) => {
                let seeds: Vec<SeedAddr> = records
                    .iter()
                    .map(|srv| SeedAddr {
                        host: srv.target().to_utf8().trim_end_matches('.').to_string(),
                        port: srv.port(),
                    })
                    .collect();
                tracing::info!(count = seeds.len(), name = %srv_name, "Resolved seeds via SRV");
                return seeds;
            }
            Err(e) => {
                tracing::debug!(name = %srv_name, error = %e, "SRV lookup failed; falling back to A/AAAA");
            }
        }

        match resolver.lookup_ip(host).await {
            Ok(records) => {
                let seeds: Vec<SeedAddr> = records
                    .iter()
                    .map(|ip| SeedAddr {
                        host: ip.to_string(),
                        port: fallback_port,
                    })
                    .collect();
                tracing::info!(count = seeds.len(), host = %host, "Resolved seeds via A/AAAA");
                seeds
            }
            Err(e) => {
                tracing::info!(host = %host, error = %e, "Bootstrap hostname did not resolve; starting as first member");
                Vec::new()
            }
        }
    }

    /// POSTs our identity to each seed in order; the first 2xx response
    /// wins. The responder's peer view (minus ourselves) lands in the
    /// gossip directory.
    pub async fn join(
        &self,
        seeds: &[SeedAddr],
        local: &NodeIdentity,
        gossip: &Gossip,
    ) -> Result<usize> {
        if seeds.is_empty() {
            return Ok(0);
        }

        let request = BootstrapRequest {
            node_id: local.id.clone(),
            address: local.address.clone(),
            gossip_port: local.gossip_port,
            http_port: local.http_port,
            enclave: local.enclave.clone(),
        };

        for seed in seeds {
            match self.post_bootstrap(seed, &request).await {
                Ok(response) => {
                    let mut learned = 0;
                    for peer in response.peers {
                        if peer.id == local.id {
                            continue;
                        }
                        gossip.add_peer(peer);
                        learned += 1;
                    }
                    tracing::info!(seed = %seed.host, peers = learned, "Joined network via seed");
                    return Ok(learned);
                }
                Err(e) => {
                    tracing::warn!(seed = %seed.host, port = seed.port, error = %e, "Seed did not accept us");
                }
            }
        }

        Err(Error::BootstrapExhausted)
    }

    async fn post_bootstrap(
        &self,
        seed: &SeedAddr,
        request: &BootstrapRequest,
    ) -> Result<BootstrapResponse> {
        let body = serde_json::to_vec(request)?;
        let mut http = self
            .client
            .post(seed.bootstrap_url())
            .header("content-type", "application/json");
        if let Some(secret) = &self.cluster_secret {
            http = http.header(auth::SIGNATURE_HEADER, auth::sign(secret, &body));
        }

        let response = http.body(body).send().await?;
        if !response.status().is_success() {
            return Err(Error::PeerUnreachable(
                seed.host.clone(),
                format!("HTTP {}", response.status()),
            ));
        }
        Ok(response.json::<BootstrapResponse>().await?)
    }

    /// Pushes our presence to one additional seed, retrying with 1 s / 2 s /
    /// 4 s backoff. Best-effort: final failure is logged and forgotten,
    /// since topology sync converges eventually anyway.
    pub async fn notify_peer_about_new_node(&self, seed: &SeedAddr, local: &NodeIdentity) {
        let request = BootstrapRequest {
            node_id: local.id.clone(),
            address: local.address.clone(),
            gossip_port: local.gossip_port,
            http_port: local.http_port,
            enclave: local.enclave.clone(),
        };

        for attempt in 0..NOTIFY_ATTEMPTS {
            match self.post_bootstrap(seed, &request).await {
                Ok(_) => return,
                Err(e) => {
                    let backoff = Duration::from_secs(1 << attempt);
                    tracing::debug!(
                        seed = %seed.host,
                        attempt = attempt + 1,
                        error = %e,
                        "Presence notification failed; backing off"
                    );
                    time::sleep(backoff).await;
                }
            }
        }
        tracing::warn!(seed = %seed.host, "Giving up on presence notification");
    }
}

// --- Unit Tests ---
