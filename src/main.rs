//! src/main.rs
//!
//! Binary entry point. Responsible for loading configuration, initializing
//! tracing, instantiating the main `App`, and running it.

use anyhow::Context;
use repram::{App, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first; its log_level seeds the tracing filter.
    let config = Config::load().context("Failed to load configuration")?;

    // RUST_LOG still wins when set.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Create and run the node.
    if let Err(e) = App::new(config)?.run().await {
        tracing::error!(error = %e, "💥 Node failed");
        std::process::exit(1);
    }

    Ok(())
}
