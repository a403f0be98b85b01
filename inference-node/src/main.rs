use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use inference_node::api::{create_api_router, AppState};
use inference_node::config::NodeConfig;
use inference_node::registry_client::RegistryClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inference_node=info,tower_http=warn".into()),
        )
        .with_target(false)
        .init();

    info!("Starting inference node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load().context("Failed to load node configuration")?;
    let state = AppState::new(config).context("Failed to build node state")?;

    state.pipeline.initialize().await;

    let registry_client = Arc::new(RegistryClient::from_config(&state.config));
    registry_client.register().await;
    registry_client.start_heartbeat().await;

    let listen_addr = state.config.node_listen_addr.clone();
    let pipeline = Arc::clone(&state.pipeline);
    let app = create_api_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;
    info!(listen_addr = %listen_addr, "Starting node API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutting down inference node");
    registry_client.shutdown().await;
    pipeline.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
