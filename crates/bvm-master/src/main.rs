//! BVM Master - WebSocket server for the btrfs volume manager.
//!
//! Browser clients and storage agents (slaves) connect to `/ws`. Clients
//! authenticate and list storage servers here; block device and btrfs requests
//! are relayed to the storage server they name.

mod auth;
mod block_devices;
mod server;
mod storage_servers;
#[cfg(test)]
mod test_support;
mod ws;

use anyhow::Result;
use auth::{parse_user, StaticAuthenticator};
use bvm_core::ConnectionConfig;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "bvm-master")]
#[command(about = "Master server for the btrfs volume manager")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Accepted credentials as name:password (repeatable)
    #[arg(long = "user", value_parser = parse_user, default_value = "admin:admin")]
    users: Vec<(String, String)>,

    /// Directory of static views to serve
    #[arg(long)]
    views: Option<PathBuf>,

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

    info!("Starting BVM master");
    info!("{} user(s) configured", args.users.len());

    let authenticator = StaticAuthenticator::new(args.users);
    let state = server::AppState::new(Arc::new(authenticator), ConnectionConfig::default());

    let addr = server::start_server(state, &args.host, args.port, args.views).await?;
    info!("Master running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
