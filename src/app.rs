//! src/app.rs
//!
//! Defines the main `App` struct, which owns every component of the node and
//! manages the lifecycle of all its concurrent services.

use crate::{
    api::{ratelimit::RateLimiter, ApiServer, AppState},
    attach::{substrate, transient, AttachmentLayer},
    bootstrap::Bootstrap,
    config::{Config, InboundCapability},
    coordinator::Coordinator,
    domain::{generate_node_id, NodeIdentity},
    error::{Error, Result},
    gossip::Gossip,
    store::Store,
    transport::HttpTransport,
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire node: configuration plus the lifecycle of its
/// concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Handle for triggering a shutdown from outside (tests, supervisors).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// The main run loop for the node.
    ///
    ///   1. Builds the component graph (store, transport, gossip,
    ///      coordinator, attachment layer) under one `AppState` root.
    ///   2. Joins the network via DNS + handshake bootstrap.
    ///   3. Spawns each service in its own Tokio task.
    ///   4. Waits for a shutdown signal, then resolves in-flight writes,
    ///      says goodbye to attached children, and joins all tasks.
    pub async fn run(self) -> Result<()> {
        let config = Arc::new(self.config);
        let node_id = if config.node_id.is_empty() {
            generate_node_id()
        } else {
            config.node_id.clone()
        };
        let local = NodeIdentity {
            id: node_id,
            address: config.address.clone(),
            gossip_port: config.gossip_port,
            http_port: config.http_port,
            enclave: config.enclave.clone(),
        };

        tracing::info!(
            node_id = %local.id,
            enclave = %local.enclave,
            http_port = local.http_port,
            "🚀 Starting node..."
        );

        // --- Component graph ---
        let secret = config.cluster_secret().map(|s| s.to_string());
        let transport = Arc::new(HttpTransport::new(secret.clone()));
        let store = Arc::new(Store::new(config.max_storage_bytes));
        let gossip = Arc::new(Gossip::new(
            local.clone(),
            config.replication_factor,
            transport,
        ));
        let attach = Arc::new(AttachmentLayer::new(
            secret.clone(),
            config.max_children,
            config.write_timeout_duration(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            local.clone(),
            store.clone(),
            gossip.clone(),
            attach.clone(),
            config.write_timeout_duration(),
            config.replication_factor,
        ));
        let state = AppState {
            config: config.clone(),
            local: local.clone(),
            store: store.clone(),
            gossip: gossip.clone(),
            coordinator: coordinator.clone(),
            attach: attach.clone(),
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            started_at: Instant::now(),
        };

        // --- Join the network ---
        let bootstrap = Bootstrap::new(secret.clone());
        let mut seeds: Vec<_> = config
            .bootstrap_peers
            .iter()
            .filter_map(|entry| {
                let seed = crate::bootstrap::SeedAddr::parse(entry);
                if seed.is_none() {
                    tracing::warn!(entry = %entry, "Ignoring unparseable bootstrap peer");
                }
                seed
            })
            .collect();
        if !config.bootstrap_host.is_empty() {
            seeds.extend(
                bootstrap
                    .resolve_seeds(&config.bootstrap_host, config.bootstrap_port)
                    .await,
            );
        }
        if !seeds.is_empty() {
            match bootstrap.join(&seeds, &local, &gossip).await {
                Ok(learned) => {
                    tracing::info!(peers = learned, "Bootstrap complete");
                    // Push our presence to the seeds that did not serve the
                    // join, so their directories converge sooner.
                    for seed in seeds.into_iter().skip(1) {
                        let bootstrap = Bootstrap::new(secret.clone());
                        let local = local.clone();
                        tokio::spawn(async move {
                            bootstrap.notify_peer_about_new_node(&seed, &local).await;
                        });
                    }
                }
                Err(Error::BootstrapExhausted) => {
                    tracing::info!("All bootstrap seeds failed; starting as first member");
                }
                Err(e) => return Err(e),
            }
        }

        // --- Spawn services ---
        let sweeper_task = tokio::spawn(store.clone().run_sweeper(self.shutdown_token.clone()));
        let gossip_task = tokio::spawn(gossip.clone().run(self.shutdown_token.clone()));
        let cleaner_task =
            tokio::spawn(attach.clone().run_route_cleaner(self.shutdown_token.clone()));
        tracing::debug!("Background services spawned.");

        // The advertised address doubles as the bind address when it is a
        // literal IP; hostnames bind the wildcard.
        let bind_ip: IpAddr = config
            .address
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let api_server = ApiServer::new(SocketAddr::new(bind_ip, config.http_port), state.clone());
        let api_task = tokio::spawn(api_server.run(self.shutdown_token.clone()));
        tracing::debug!("HTTP service spawned.");

        // Nodes that cannot take inbound connections participate through a
        // persistent session to a substrate instead of the mesh.
        let attach_task = if config.inbound == InboundCapability::False {
            let state = state.clone();
            let token = self.shutdown_token.clone();
            Some(tokio::spawn(transient::run(state, token)))
        } else {
            None
        };

        // --- Wait for Shutdown Signal ---
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received. Initiating graceful shutdown...");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        // --- Graceful teardown ---
        coordinator.stop();
        substrate::send_shutdown_goodbyes(&state);

        if let Err(e) = sweeper_task.await {
            tracing::error!(error = ?e, "Store sweeper task failed");
        }
        if let Err(e) = gossip_task.await {
            tracing::error!(error = ?e, "Gossip service task failed");
        }
        if let Err(e) = cleaner_task.await {
            tracing::error!(error = ?e, "Route cleaner task failed");
        }
        if let Err(e) = api_task.await {
            tracing::error!(error = ?e, "HTTP service task failed");
        }
        if let Some(task) = attach_task {
            if let Err(e) = task.await {
                tracing::error!(error = ?e, "Attachment client task failed");
            }
        }
        tracing::info!("👋 Node has shut down gracefully.");

        Ok(())
    }
}
