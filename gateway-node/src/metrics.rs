use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, describe_counter, describe_gauge};
use serde::Serialize;

/// Snapshotable request counters and latency accumulators.
///
/// Served as JSON from `GET /metrics`. The same events are mirrored onto the
/// `metrics` facade so an optional Prometheus exporter can scrape them.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Request counts keyed `{endpoint}_{status}`.
    requests: DashMap<String, AtomicU64>,
    /// Subset of the above with status >= 400.
    errors: DashMap<String, AtomicU64>,
    /// Cumulative latency per endpoint, in microseconds.
    latency_sum_micros: DashMap<String, AtomicU64>,
    latency_count: DashMap<String, AtomicU64>,
    rate_limit_hits: AtomicU64,
    circuit_breaker_opens: AtomicU64,
}

/// Point-in-time view of the registry, serialized on `/metrics`.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: BTreeMap<String, u64>,
    pub errors_total: BTreeMap<String, u64>,
    pub rate_limit_hits_total: u64,
    pub circuit_breaker_opens_total: u64,
    pub latency_avg_seconds: BTreeMap<String, f64>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request with its status and latency.
    pub fn record_request(&self, endpoint: &str, status: u16, latency: Duration) {
        let key = format!("{endpoint}_{status}");
        self.requests
            .entry(key.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.latency_sum_micros
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        if status >= 400 {
            self.errors
                .entry(key)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        counter!(
            "gateway_requests_total",
            1,
            "endpoint" => endpoint.to_string(),
            "status" => status.to_string()
        );
    }

    pub fn record_rate_limit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_rate_limit_hits_total", 1);
    }

    pub fn record_circuit_breaker_open(&self) {
        self.circuit_breaker_opens.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_circuit_breaker_opens_total", 1);
    }

    pub fn circuit_breaker_opens(&self) -> u64 {
        self.circuit_breaker_opens.load(Ordering::Relaxed)
    }

    pub fn rate_limit_hits(&self) -> u64 {
        self.rate_limit_hits.load(Ordering::Relaxed)
    }

    /// Render all counters into a serializable snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests_total = self
            .requests
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        let errors_total = self
            .errors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let mut latency_avg_seconds = BTreeMap::new();
        for entry in self.latency_sum_micros.iter() {
            let count = self
                .latency_count
                .get(entry.key())
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            if count > 0 {
                let sum_micros = entry.value().load(Ordering::Relaxed);
                let avg_seconds = sum_micros as f64 / count as f64 / 1_000_000.0;
                latency_avg_seconds.insert(format!("{}_avg_seconds", entry.key()), avg_seconds);
            }
        }

        MetricsSnapshot {
            requests_total,
            errors_total,
            rate_limit_hits_total: self.rate_limit_hits.load(Ordering::Relaxed),
            circuit_breaker_opens_total: self.circuit_breaker_opens.load(Ordering::Relaxed),
            latency_avg_seconds,
        }
    }
}

/// Register descriptions for everything the gateway emits on the facade.
pub fn describe_metrics() {
    describe_counter!(
        "gateway_requests_total",
        "Total requests served, by endpoint and status"
    );
    describe_counter!(
        "gateway_rate_limit_hits_total",
        "Requests rejected by the per-tenant rate limiter"
    );
    describe_counter!(
        "gateway_circuit_breaker_opens_total",
        "Circuit breaker open transitions"
    );
    describe_counter!(
        "gateway_nodes_registered_total",
        "Node registrations accepted"
    );
    describe_counter!(
        "gateway_heartbeats_received_total",
        "Heartbeats accepted from registered nodes"
    );
    describe_counter!(
        "gateway_nodes_evicted_total",
        "Nodes deleted after extended heartbeat absence"
    );
    describe_gauge!(
        "gateway_registered_nodes",
        "Current number of nodes in the registry"
    );
}
