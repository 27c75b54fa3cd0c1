//! BVM Slave entry point.

use anyhow::{Context, Result};
use bvm_core::{dtos, ConnectionConfig, Dialer, JsonCodec};
use bvm_slave::{agent_router, authenticate, register, StorageProbe, SystemProbe};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bvm-slave")]
#[command(about = "Storage agent for the btrfs volume manager")]
struct Args {
    /// WebSocket URL of the master
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    master_url: String,

    /// Name to register under (defaults to the host name)
    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value = "admin")]
    username: String,

    #[arg(long, default_value = "admin")]
    password: String,

    /// Directory under which btrfs filesystems are mounted
    #[arg(long, default_value = "/mnt/btrfs-roots")]
    mount_root: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| "storage-server".to_string());
    info!("Starting BVM slave {} ({})", name, bvm_slave::SLAVE_VERSION);

    let probe: Arc<dyn StorageProbe> = Arc::new(SystemProbe::new());
    let os_version = probe.os_version();
    let router = Arc::new(agent_router(probe, &args.mount_root));

    let registry = Arc::new(dtos::standard_registry());
    let dialer = Dialer::new(Arc::new(JsonCodec::new(registry)), ConnectionConfig::default());
    let dialed = dialer
        .dial(&args.master_url, &router)
        .await
        .with_context(|| format!("Failed to connect to {}", args.master_url))?;

    authenticate(&dialed.context, &args.username, &args.password)
        .await
        .context("Authentication failed")?;
    let id = register(&dialed.context, &name, os_version)
        .await
        .context("Registration failed")?;
    info!("Serving as storage server {}", id);

    tokio::select! {
        _ = dialed.connection.closed() => {
            warn!("Connection to master closed");
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received, closing connection");
            dialed.connection.close();
            dialed.connection.closed().await;
        }
    }

    Ok(())
}
