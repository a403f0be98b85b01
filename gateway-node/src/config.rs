use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

fn default_listen_addr() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_request_timeout_sec() -> u64 {
    30
}

fn default_node_eviction_timeout_sec() -> u64 {
    10
}

fn default_heartbeat_interval_sec() -> u64 {
    5
}

fn default_tenant_rate_limit() -> u32 {
    100
}

fn default_gateway_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    1
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_recovery_timeout_sec() -> u64 {
    30
}

fn default_circuit_half_open_max_attempts() -> u32 {
    3
}

/// Gateway configuration.
///
/// Loaded from an optional `gateway.toml` plus the process environment; every
/// field has a default so a bare environment boots a working gateway. The
/// environment variable for each field is its name upper-cased
/// (`GATEWAY_TIMEOUT_MS`, `TENANT_RATE_LIMIT`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the gateway API.
    #[serde(default = "default_listen_addr")]
    pub gateway_listen_addr: String,
    /// Optional listen address for the Prometheus metrics exporter.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Per-request ceiling for client-facing work, in seconds.
    #[serde(default = "default_request_timeout_sec")]
    pub request_timeout_sec: u64,
    /// Heartbeat age past which a node is unhealthy; twice this deletes it.
    #[serde(default = "default_node_eviction_timeout_sec")]
    pub node_eviction_timeout_sec: u64,
    /// Eviction scan period.
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    /// Enables the `/infer/stream` passthrough endpoint.
    #[serde(default)]
    pub enable_streaming: bool,
    /// Flat `tenant:key,tenant:key` API key list.
    #[serde(default)]
    pub api_keys: String,
    /// Per-tenant admitted requests per trailing minute.
    #[serde(default = "default_tenant_rate_limit")]
    pub tenant_rate_limit: u32,
    /// Timeout applied to each forwarded node call, in milliseconds.
    #[serde(default = "default_gateway_timeout_ms")]
    pub gateway_timeout_ms: u64,
    /// Additional forwarding attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failures before a node's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Open-circuit age before half-open probing begins, in seconds.
    #[serde(default = "default_circuit_recovery_timeout_sec")]
    pub circuit_recovery_timeout_sec: u64,
    /// Half-open probes permitted before the circuit force-closes.
    #[serde(default = "default_circuit_half_open_max_attempts")]
    pub circuit_half_open_max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_listen_addr: default_listen_addr(),
            metrics_addr: None,
            request_timeout_sec: default_request_timeout_sec(),
            node_eviction_timeout_sec: default_node_eviction_timeout_sec(),
            heartbeat_interval_sec: default_heartbeat_interval_sec(),
            enable_streaming: false,
            api_keys: String::new(),
            tenant_rate_limit: default_tenant_rate_limit(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            max_retries: default_max_retries(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_timeout_sec: default_circuit_recovery_timeout_sec(),
            circuit_half_open_max_attempts: default_circuit_half_open_max_attempts(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `gateway.toml` (if present) and the
    /// environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("gateway").required(false))
            .add_source(config::Environment::default())
            .build()?;
        settings.try_deserialize()
    }

    /// Reject configurations that cannot serve traffic.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.node_eviction_timeout_sec == 0 {
            return Err(GatewayError::Config(
                "node_eviction_timeout_sec must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval_sec == 0 {
            return Err(GatewayError::Config(
                "heartbeat_interval_sec must be positive".to_string(),
            ));
        }
        if self.gateway_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "gateway_timeout_ms must be positive".to_string(),
            ));
        }
        if self.tenant_rate_limit == 0 {
            return Err(GatewayError::Config(
                "tenant_rate_limit must be positive".to_string(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse the `API_KEYS` value into an `api_key -> tenant_id` map.
    ///
    /// Malformed entries (no colon) are skipped.
    pub fn api_key_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for pair in self.api_keys.split(',') {
            let pair = pair.trim();
            if let Some((tenant_id, api_key)) = pair.split_once(':') {
                map.insert(api_key.trim().to_string(), tenant_id.trim().to_string());
            }
        }
        map
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.node_eviction_timeout_sec)
    }

    pub fn eviction_scan_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_sec)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn circuit_recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_recovery_timeout_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = GatewayConfig::default();
        assert_eq!(config.node_eviction_timeout_sec, 10);
        assert_eq!(config.heartbeat_interval_sec, 5);
        assert_eq!(config.tenant_rate_limit, 100);
        assert_eq!(config.gateway_timeout_ms, 30_000);
        assert_eq!(config.max_retries, 1);
        assert!(!config.enable_streaming);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn api_key_map_parses_tenant_key_pairs() {
        let config = GatewayConfig {
            api_keys: "acme:key-1, globex:key-2,broken-entry".to_string(),
            ..GatewayConfig::default()
        };
        let map = config.api_key_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("key-1").map(String::as_str), Some("acme"));
        assert_eq!(map.get("key-2").map(String::as_str), Some("globex"));
    }

    #[test]
    fn empty_api_keys_yield_empty_map() {
        let config = GatewayConfig::default();
        assert!(config.api_key_map().is_empty());
    }

    #[test]
    fn zero_timeouts_rejected() {
        let config = GatewayConfig {
            gateway_timeout_ms: 0,
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
