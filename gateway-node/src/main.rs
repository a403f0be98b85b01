use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gateway_node::api::{create_api_router, AppState};
use gateway_node::config::GatewayConfig;
use gateway_node::metrics::describe_metrics;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway_node=info,tower_http=warn".into()),
        )
        .with_target(false)
        .init();

    info!("Starting inference gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load().context("Failed to load gateway configuration")?;
    let state = AppState::new(config).context("Failed to build gateway state")?;

    describe_metrics();
    if let Some(metrics_addr) = state.config.metrics_addr.clone() {
        start_metrics_exporter(&metrics_addr)?;
    }

    let shutdown_token = CancellationToken::new();
    let eviction_task = std::sync::Arc::clone(&state.registry)
        .spawn_eviction_loop(state.config.eviction_scan_period(), shutdown_token.clone());

    let listen_addr = state.config.gateway_listen_addr.clone();
    let app = create_api_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;
    info!(listen_addr = %listen_addr, "Starting gateway API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutting down gateway");
    shutdown_token.cancel();
    let _ = eviction_task.await;
    Ok(())
}

/// Start the Prometheus exporter on its own listener.
fn start_metrics_exporter(addr: &str) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics address {addr}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(metrics_addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
