//! CubeFS data node
//!
//! Serves the data partitions assigned to this node: raft random writes,
//! replica repair and the node HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use cubefs_common::DataNodeConfig;
use cubefs_datanode::{HttpPeerClient, PeerClient, SpaceManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cubefs-datanode")]
#[command(about = "CubeFS data node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "CUBEFS_DATANODE_CONFIG", default_value = "/etc/cubefs/datanode.toml")]
    config: PathBuf,

    /// HTTP listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Replica address of this node (`ip:port`)
    #[arg(long)]
    local_addr: Option<String>,

    /// Directory holding the partition directories
    #[arg(long)]
    data_path: Option<PathBuf>,

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

fn load_config(args: &Args) -> Result<DataNodeConfig> {
    let mut config = if args.config.exists() {
        DataNodeConfig::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
        DataNodeConfig::default()
    };
    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(local_addr) = &args.local_addr {
        config.local_addr.clone_from(local_addr);
    }
    if let Some(data_path) = &args.data_path {
        config.data_path.clone_from(data_path);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    info!("Starting CubeFS data node");
    let config = load_config(&args)?;
    info!("Data path: {}", config.data_path.display());
    info!("Local address: {}", config.local_addr);
    info!("Assigned partitions: {}", config.partitions.len());

    let peer_client: Arc<dyn PeerClient> = Arc::new(HttpPeerClient::new(&config.peer)?);
    let listen = config.listen.clone();
    let space = Arc::new(SpaceManager::new(config, peer_client));
    space.load().await.context("loading data partitions")?;
    space.start_maintenance();

    let app = cubefs_datanode::http::router(Arc::clone(&space));
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!("HTTP API listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    space.shutdown().await;
    info!("Data node shut down gracefully");
    Ok(())
}
