use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NodeError;

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_batch_max_size() -> usize {
    8
}

fn default_batch_max_latency_ms() -> u64 {
    50
}

fn default_max_in_flight_requests() -> usize {
    100
}

fn default_heartbeat_interval_sec() -> u64 {
    5
}

fn default_node_max_capacity() -> u32 {
    100
}

/// Inference node configuration.
///
/// Loaded from an optional `node.toml` plus the process environment; the
/// environment variable for each field is its name upper-cased
/// (`BATCH_MAX_SIZE`, `USE_MOCK_MODEL`, `GATEWAY_URL`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address for the node API.
    #[serde(default = "default_listen_addr")]
    pub node_listen_addr: String,
    /// URL advertised to the gateway; defaults to the listen address.
    #[serde(default)]
    pub node_advertise_url: Option<String>,
    /// Serve with the mock model (no GPU required).
    #[serde(default)]
    pub use_mock_model: bool,
    /// Requests per batch before an immediate flush.
    #[serde(default = "default_batch_max_size")]
    pub batch_max_size: usize,
    /// Oldest-request age that forces a flush, in milliseconds.
    #[serde(default = "default_batch_max_latency_ms")]
    pub batch_max_latency_ms: u64,
    /// Admission queue capacity; beyond it requests are rejected.
    #[serde(default = "default_max_in_flight_requests")]
    pub max_in_flight_requests: usize,
    /// Gateway base URL for registration and heartbeats.
    #[serde(default)]
    pub gateway_url: Option<String>,
    /// Node identifier reported to the gateway.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Heartbeat period in seconds.
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    /// Concurrent-request ceiling advertised to the gateway.
    #[serde(default = "default_node_max_capacity")]
    pub node_max_capacity: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_listen_addr: default_listen_addr(),
            node_advertise_url: None,
            use_mock_model: false,
            batch_max_size: default_batch_max_size(),
            batch_max_latency_ms: default_batch_max_latency_ms(),
            max_in_flight_requests: default_max_in_flight_requests(),
            gateway_url: None,
            node_id: None,
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            node_max_capacity: default_node_max_capacity(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from `node.toml` (if present) and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("node").required(false))
            .add_source(config::Environment::default())
            .build()?;
        settings.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.batch_max_size == 0 {
            return Err(NodeError::Config(
                "batch_max_size must be positive".to_string(),
            ));
        }
        if self.batch_max_latency_ms == 0 {
            return Err(NodeError::Config(
                "batch_max_latency_ms must be positive".to_string(),
            ));
        }
        if self.max_in_flight_requests == 0 {
            return Err(NodeError::Config(
                "max_in_flight_requests must be positive".to_string(),
            ));
        }
        if self.node_max_capacity == 0 {
            return Err(NodeError::Config(
                "node_max_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn batch_max_latency(&self) -> Duration {
        Duration::from_millis(self.batch_max_latency_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    /// The URL the gateway should forward calls to.
    pub fn advertise_url(&self) -> String {
        self.node_advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.node_listen_addr))
    }
}
