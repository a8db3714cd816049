//! Caladan Gateway binary
//!
//! Runs a shard fleet against the chat gateway:
//! - Loads configuration from the environment
//! - Spawns the shard manager and its identify queue
//! - Exposes health/ready endpoints for Kubernetes
//! - Exports Prometheus metrics for observability

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use caladan_gateway::health::{self, AppState};
use caladan_gateway::{GatewayConfig, GatewayMetrics, MetaEvent, ShardManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("caladan_gateway={}", gateway_config.log_level).parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway_version = gateway_config.gateway_version,
        "Starting Caladan Gateway"
    );

    let metrics = Arc::new(GatewayMetrics::new());
    info!("Prometheus metrics initialized");

    let http_port = gateway_config.http_port;
    let manager = Arc::new(ShardManager::new(gateway_config, Arc::clone(&metrics)).await?);

    manager.on_meta(|event| match event {
        MetaEvent::ShardOnline(shard_id) => info!(shard_id, "Shard online"),
        MetaEvent::Error { shard_id, message, .. } => {
            warn!(?shard_id, message = %message, "Gateway error");
        }
        MetaEvent::Debug { .. } => {}
    });

    let fleet = manager.state();
    info!(shard_count = fleet.shard_count(), "Shard fleet prepared");

    // Start health server
    let app_state = AppState {
        fleet,
        metrics: Arc::clone(&metrics),
    };
    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], http_port).into();

    info!(port = http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    // SIGTERM (Kubernetes) and Ctrl+C both trigger a graceful destroy.
    let shutdown = async {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        }
    };

    tokio::select! {
        result = manager.run() => {
            if let Err(e) = result {
                error!(error = %e, "Shard manager error");
            }
        }
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {
            info!("Shutdown signal received");
        }
    }

    // Graceful shutdown
    info!("Shutting down gateway...");
    manager.destroy().await;

    info!("Gateway shutdown complete");
    Ok(())
}
