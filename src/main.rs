//! Replica Stage Daemon
//!
//! Serves the blob API and, with the aggregated backend, replicates
//! uploads through the remote aggregation service.
//!
//! ## Usage
//!
//! ```bash
//! # Local-only staging with defaults
//! replica-stage
//!
//! # Custom config file
//! replica-stage --config /path/to/config.toml
//!
//! # Replicate through an aggregator
//! REPLICA_STAGE_WALLET_KEY=7b22... replica-stage \
//!     --backend aggregated --aggregator-url http://localhost:9090
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health` - Health check
//! - `POST /v0/blob` - Store a blob
//! - `GET /v0/blob/{id}` - Retrieve a blob
//! - `GET /v0/blob/{id}/status` - Replication status

use clap::Parser;
use replica_stage::{Backend, BackendKind, Config, HttpServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// How long background work may take to wind down on shutdown
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "replica-stage")]
#[command(about = "Blob staging service with storage network replication")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Blob store backend
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,

    /// Aggregation service base URL
    #[arg(long, env = "REPLICA_STAGE_AGGREGATOR_URL")]
    aggregator_url: Option<String>,

    /// Wallet private key handed to the aggregator
    #[arg(long, env = "REPLICA_STAGE_WALLET_KEY", hide_env_values = true)]
    wallet_key: Option<String>,

    /// Free bytes that must remain on the staging disk
    #[arg(long)]
    min_free_space: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("replica_stage=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        let storage_dir = args
            .storage_dir
            .clone()
            .unwrap_or_else(replica_stage::config::default_storage_dir);
        let default_path = storage_dir.join("config.toml");
        if default_path.exists() {
            Config::load(&default_path)?
        } else {
            Config::default()
        }
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(url) = args.aggregator_url {
        config.aggregator.url = url;
    }
    if let Some(key) = args.wallet_key {
        config.aggregator.wallet_key = key;
    }
    if let Some(min_free_space) = args.min_free_space {
        config.min_free_space = min_free_space;
    }

    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        backend = %config.backend,
        "Starting replica-stage"
    );

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist. The wallet key is left out.
    let config_path = config.config_path();
    if !config_path.exists() {
        let mut persisted = config.clone();
        persisted.aggregator.wallet_key.clear();
        persisted.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let backend = Backend::from_config(&config).await?;
    backend.start().await?;

    let shutdown = CancellationToken::new();
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(
        backend.clone(),
        config.max_blob_length,
        shutdown.clone(),
    ));
    info!("HTTP API available at http://{}", http_addr);

    let mut server = tokio::spawn(http_server.run(http_addr));

    info!("Press Ctrl+C to stop.");
    let server_result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            shutdown.cancel();
            server.await
        }
        result = &mut server => result,
    };
    shutdown.cancel();
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task failed"),
    }

    if let Err(e) = backend.shutdown(SHUTDOWN_DEADLINE).await {
        error!(error = %e, "Backend did not stop cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}
