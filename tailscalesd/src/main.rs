use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use tailscalesd::api;
use tailscalesd::config::{Cli, Config, Source};
use tailscalesd::discovery::{Discoverer, LocalApi, MultiDiscoverer, PublicApi, RateLimited};
use tailscalesd::metrics::{Metrics, Registry};
use tailscalesd::translate::{filter_ipv6_addresses, TargetFilter};

fn build_discoverer(config: &Config, registry: Arc<Registry>) -> Result<MultiDiscoverer> {
    let metrics: Arc<dyn Metrics> = registry;
    let poll_limit = config.discovery.poll_limit;
    let mut multi = MultiDiscoverer::new(Vec::new()).with_metrics(metrics.clone());

    for source in config.sources()? {
        let discoverer: Arc<dyn Discoverer> = match source {
            Source::Local { socket } => {
                tracing::info!("Using local API at {}", socket.display());
                let local = LocalApi::new(socket).with_metrics(metrics.clone());
                Arc::new(RateLimited::new(local, poll_limit).with_metrics(metrics.clone()))
            }
            Source::Public {
                tailnet,
                api_host,
                credentials,
            } => {
                tracing::info!(
                    "Using public API at {} for tailnet {} with {:?}",
                    api_host,
                    tailnet,
                    credentials
                );
                let public = PublicApi::new(tailnet, credentials)
                    .context("Failed to build public API client")?
                    .with_api_base(&api_host)
                    .with_metrics(metrics.clone());
                Arc::new(RateLimited::new(public, poll_limit).with_metrics(metrics.clone()))
            }
        };
        multi.push(discoverer);
    }

    Ok(multi)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tailscalesd=info")),
        )
        .init();

    let config = Config::from_cli(Cli::parse())?;

    let registry = Arc::new(Registry::new());
    let discoverer = build_discoverer(&config, registry.clone())?;
    tracing::info!(
        "Polling {} source(s) no more than every {}",
        discoverer.len(),
        humantime::format_duration(config.discovery.poll_limit)
    );

    let mut filters: Vec<TargetFilter> = Vec::new();
    if !config.discovery.include_ipv6 {
        filters.push(filter_ipv6_addresses);
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let state = api::routes::export(Arc::new(discoverer), &filters)
        .with_registry(registry)
        .with_shutdown(cancel.clone());
    let app = api::routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("Serving Tailscale service discovery on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    if let Err(e) = server_handle.await {
        tracing::error!("Server task failed: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
