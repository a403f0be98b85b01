use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use serving_common::RegisterRequest;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

/// Keeps this node's gateway membership alive: registration on startup and a
/// periodic heartbeat loop.
///
/// Membership is best-effort; every failure is logged and the node keeps
/// serving direct traffic. There is no explicit deregistration, gateway
/// eviction handles silent exits.
pub struct RegistryClient {
    gateway_url: Option<String>,
    node_id: Option<String>,
    node_url: String,
    max_capacity: u32,
    heartbeat_interval: Duration,
    client: Client,
    token: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl RegistryClient {
    pub fn new(
        gateway_url: Option<String>,
        node_id: Option<String>,
        node_url: String,
        max_capacity: u32,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            gateway_url,
            node_id,
            node_url,
            max_capacity,
            heartbeat_interval,
            client: Client::new(),
            token: CancellationToken::new(),
            heartbeat_task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.gateway_url.clone(),
            config.node_id.clone(),
            config.advertise_url(),
            config.node_max_capacity,
            config.heartbeat_interval(),
        )
    }

    /// Register with the gateway. Returns whether registration succeeded.
    pub async fn register(&self) -> bool {
        let (Some(gateway_url), Some(node_id)) = (&self.gateway_url, &self.node_id) else {
            warn!("Skipping registration: GATEWAY_URL or NODE_ID not set");
            return false;
        };

        let url = format!("{}/register", gateway_url.trim_end_matches('/'));
        let payload = RegisterRequest {
            node_id: node_id.clone(),
            url: self.node_url.clone(),
            max_capacity: self.max_capacity,
        };

        match self
            .client
            .post(&url)
            .json(&payload)
            .timeout(REGISTER_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(
                    node_id = %node_id,
                    gateway = %gateway_url,
                    max_capacity = self.max_capacity,
                    "Node registered with gateway"
                );
                true
            }
            Ok(response) => {
                error!(
                    status = response.status().as_u16(),
                    "Registration rejected by gateway"
                );
                false
            }
            Err(err) => {
                error!(error = %err, "Registration failed");
                false
            }
        }
    }

    /// Start the heartbeat loop. A second call is a no-op.
    pub async fn start_heartbeat(&self) {
        let (Some(gateway_url), Some(node_id)) = (&self.gateway_url, &self.node_id) else {
            return;
        };
        let mut task_slot = self.heartbeat_task.lock().await;
        if task_slot.is_some() {
            return;
        }

        let url = format!(
            "{}/heartbeat/{}",
            gateway_url.trim_end_matches('/'),
            node_id
        );
        let client = self.client.clone();
        let token = self.token.clone();
        let interval = self.heartbeat_interval;
        let node_id = node_id.clone();

        *task_slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match client
                    .post(&url)
                    .timeout(HEARTBEAT_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        debug!(node_id = %node_id, "Heartbeat sent");
                    }
                    Ok(response) => {
                        warn!(
                            node_id = %node_id,
                            status = response.status().as_u16(),
                            "Heartbeat rejected"
                        );
                    }
                    Err(err) => {
                        warn!(node_id = %node_id, error = %err, "Heartbeat failed");
                    }
                }
            }
            info!(node_id = %node_id, "Heartbeat loop stopped");
        }));
    }

    /// Cancel the heartbeat loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.heartbeat_task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
