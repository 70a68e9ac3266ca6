//! tutor-sync-relay binary entry point.
//!
//! Usage:
//! ```bash
//! tutor-sync-relay --config relay.toml
//! tutor-sync-relay --bind 127.0.0.1:9000
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tutor_sync_relay::config::Config;
use tutor_sync_relay::http::{self, health};
use tutor_sync_relay::orchestrator::RelayOrchestrator;

/// Session relay and role-coordination server.
#[derive(Debug, Parser)]
#[command(name = "tutor-sync-relay", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override `server.bind_address`.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    health::init_start_time();
    let bind_address = config.server.bind_address.clone();
    let relay = Arc::new(RelayOrchestrator::new(config));
    relay.start();

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("binding {}", bind_address))?;
    tracing::info!(
        "tutor-sync-relay v{} listening on {}",
        env!("CARGO_PKG_VERSION"),
        listener.local_addr()?
    );

    tokio::select! {
        result = http::serve(listener, relay.clone()) => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutdown requested"),
    }

    relay.stop().await;
    Ok(())
}
