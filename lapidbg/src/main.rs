//! Dump the peers reported by the local tailscaled API.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use shared::protocol::LOCAL_API_SOCKET;
use tailscalesd::discovery::LocalApi;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "lapidbg", version)]
struct Cli {
    /// Unix domain socket on which the local tailscaled API listens
    #[arg(long, env = "TAILSCALE_LOCAL_API_SOCKET", default_value = LOCAL_API_SOCKET)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api = LocalApi::new(&cli.socket);

    let status = api
        .status(&CancellationToken::new())
        .await
        .with_context(|| {
            format!(
                "Failed getting status from Tailscale local API at {}",
                cli.socket.display()
            )
        })?;

    if let Some(tailnet) = &status.current_tailnet {
        tracing::info!("Tailnet {}", tailnet.name);
    }

    for (key, peer) in status.peer.iter().flatten() {
        tracing::info!(
            "Found peer {} ({}): id={} os={} addresses={:?} tags={:?} online={:?}",
            peer.host_name,
            key,
            peer.id,
            peer.os,
            peer.tailscale_ips.as_deref().unwrap_or_default(),
            peer.tags.as_deref().unwrap_or_default(),
            peer.online
        );
    }

    Ok(())
}
