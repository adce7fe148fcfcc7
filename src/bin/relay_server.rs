//! Standalone rendezvous relay server
//!
//! Runs the WebSocket relay that peerlink clients use to find each other.
//! The relay only routes rendezvous frames; no application traffic ever
//! passes through it.

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peerlink::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "relay_server", about = "peerlink rendezvous relay", version)]
struct Args {
    /// Address to bind the WebSocket listener to
    #[arg(long, default_value = "0.0.0.0:9090", env = "PEERLINK_RELAY_BIND")]
    bind: String,

    /// Log filter, e.g. "info" or "peerlink=debug"
    #[arg(long, default_value = "info", env = "PEERLINK_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = RelayServer::bind(&args.bind).await?;
    info!("Relay ready at {}", server.url());
    let handle = server.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
