use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::GatewayMetrics;

/// Circuit breaker tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Open-circuit age before half-open probing begins.
    pub recovery_timeout: Duration,
    /// Probes permitted while half-open before the circuit force-closes.
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

/// Breaker state for a single node.
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub failures: u32,
    pub last_failure: Option<Instant>,
    pub is_open: bool,
    pub half_open_attempts: u32,
}

/// Per-node three-state circuit breaker.
///
/// Closed counts failures; Open rejects until `recovery_timeout` has passed;
/// Half-Open lets through a bounded number of probes, each availability check
/// consuming one slot. A success while open closes the circuit outright.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, CircuitState>,
    metrics: Arc<GatewayMetrics>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
            metrics,
        }
    }

    /// Record a successful call to a node.
    pub fn record_success(&self, node_id: &str) {
        let Some(mut state) = self.circuits.get_mut(node_id) else {
            return;
        };
        if state.is_open {
            state.is_open = false;
            state.failures = 0;
            state.half_open_attempts = 0;
            info!(node_id = %node_id, "Circuit breaker closed");
        } else {
            state.failures = 0;
        }
    }

    /// Record a failed call to a node, opening the circuit at the threshold.
    pub fn record_failure(&self, node_id: &str) {
        let mut state = self.circuits.entry(node_id.to_string()).or_default();
        state.failures += 1;
        state.last_failure = Some(Instant::now());

        if state.failures >= self.config.failure_threshold && !state.is_open {
            state.is_open = true;
            self.metrics.record_circuit_breaker_open();
            warn!(
                node_id = %node_id,
                failures = state.failures,
                "Circuit breaker opened"
            );
        }
    }

    /// Whether a call may be sent to the node right now.
    ///
    /// While half-open this consumes one probe slot per call; once the slots
    /// are spent the circuit resets to closed.
    pub fn is_available(&self, node_id: &str) -> bool {
        let Some(mut state) = self.circuits.get_mut(node_id) else {
            return true;
        };
        if !state.is_open {
            return true;
        }

        let recovered = state
            .last_failure
            .map(|at| at.elapsed() >= self.config.recovery_timeout)
            .unwrap_or(true);
        if !recovered {
            return false;
        }

        if state.half_open_attempts < self.config.half_open_max_attempts {
            state.half_open_attempts += 1;
            info!(
                node_id = %node_id,
                attempt = state.half_open_attempts,
                "Circuit breaker half-open"
            );
        } else {
            state.is_open = false;
            state.failures = 0;
            state.half_open_attempts = 0;
            info!(node_id = %node_id, "Circuit breaker reset");
        }
        true
    }

    pub fn state(&self, node_id: &str) -> Option<CircuitState> {
        self.circuits.get(node_id).map(|state| state.clone())
    }
}
