//! CubeFS flash node
//!
//! Read cache tier: serves hot file blocks from tmpfs and fills misses from
//! the data nodes.

mod api;
mod origin;

use anyhow::{Context, Result};
use clap::Parser;
use cubefs_cache::{CacheEngine, CacheEngineConfig, SourceReader};
use cubefs_common::FlashNodeConfig;
use origin::DataNodeSourceReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound between two expiry sweeps
const MAX_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "cubefs-flashnode")]
#[command(about = "CubeFS flash node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CUBEFS_FLASHNODE_CONFIG", default_value = "/etc/cubefs/flashnode.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// tmpfs directory for cache block files
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Log level
    #[arg(long, env = "CUBEFS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| log_level.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn load_config(args: &Args) -> Result<FlashNodeConfig> {
    let mut config = if args.config.exists() {
        FlashNodeConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
        FlashNodeConfig::default()
    };
    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(cache_path) = &args.cache_path {
        config.cache_path.clone_from(cache_path);
    }
    config.validate()?;
    Ok(config)
}

/// Periodically drop blocks idle for longer than `ttl`.
async fn expiry_loop(engine: Arc<CacheEngine>, ttl: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(ttl.clamp(Duration::from_secs(1), MAX_EXPIRY_INTERVAL));
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let evicted = engine.evict_expired(ttl);
        if evicted > 0 {
            debug!(evicted, "expired cache blocks evicted");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    info!("Starting CubeFS flash node");
    let config = load_config(&args)?;
    info!("Cache path: {}", config.cache_path.display());
    info!(
        "Cache capacity: {} MB, block size: {} KB, workers per block: {}",
        config.cache_total_capacity / 1024 / 1024,
        config.cache_block_size / 1024,
        config.cache_block_worker_max
    );

    let reader: Arc<dyn SourceReader> = Arc::new(DataNodeSourceReader::new(&config.peer)?);
    let engine = Arc::new(
        CacheEngine::open(CacheEngineConfig::from(&config), reader)
            .context("opening cache engine")?,
    );

    let cancel = CancellationToken::new();
    let expiry = tokio::spawn(expiry_loop(
        Arc::clone(&engine),
        config.cache_block_ttl(),
        cancel.clone(),
    ));

    let app = api::router(Arc::clone(&engine));
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("HTTP API listening on {}", config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    cancel.cancel();
    expiry.await.ok();
    let evicted = engine.evict_all();
    info!(evicted, "Flash node shut down gracefully");
    Ok(())
}
