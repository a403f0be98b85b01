use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::GatewayError;

/// One registered inference node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Unique node identifier, registry key.
    pub node_id: String,
    /// Base URL forwarded calls are sent to.
    pub url: String,
    /// Advertised concurrent-request ceiling.
    pub max_capacity: u32,
    /// Live count of in-flight forwarded requests.
    pub current_load: u32,
    /// Monotonic timestamp of the last heartbeat.
    pub last_heartbeat: Instant,
    /// Cached health flag, cleared when the heartbeat goes stale.
    pub healthy: bool,
}

impl NodeInfo {
    fn new(node_id: String, url: String, max_capacity: u32) -> Self {
        Self {
            node_id,
            url,
            max_capacity,
            current_load: 0,
            last_heartbeat: Instant::now(),
            healthy: true,
        }
    }

    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_load)
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() > timeout
    }
}

/// Per-node load and health summary, used for logging and tests.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub node_id: String,
    pub url: String,
    pub load: u32,
    pub capacity: u32,
    pub healthy: bool,
}

/// Fleet-level registry summary.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_nodes: usize,
    pub healthy_nodes: usize,
    pub nodes: Vec<NodeStats>,
}

/// Ephemeral node membership: registration, heartbeats, load counters, and
/// staleness eviction.
///
/// All mutations are serialized under one mutex; the eviction loop takes the
/// same lock. The map is ordered by node id so selection tie-breaking is
/// deterministic.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Mutex<BTreeMap<String, NodeInfo>>,
    eviction_timeout: Duration,
}

impl NodeRegistry {
    pub fn new(eviction_timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            eviction_timeout,
        }
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<String, NodeInfo>> {
        match self.nodes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Node registry mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Insert or replace a node. Resets heartbeat and load, marks healthy.
    pub fn register(
        &self,
        node_id: &str,
        url: &str,
        max_capacity: u32,
    ) -> Result<(), GatewayError> {
        if max_capacity == 0 {
            return Err(GatewayError::InvalidRegistration(
                "max_capacity must be positive".to_string(),
            ));
        }
        let mut nodes = self.nodes();
        nodes.insert(
            node_id.to_string(),
            NodeInfo::new(node_id.to_string(), url.to_string(), max_capacity),
        );
        counter!("gateway_nodes_registered_total", 1);
        gauge!("gateway_registered_nodes", nodes.len() as f64);
        info!(
            node_id = %node_id,
            url = %url,
            max_capacity,
            "Node registered"
        );
        Ok(())
    }

    /// Refresh a node's heartbeat and mark it healthy. Returns false for
    /// unknown nodes.
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes();
        match nodes.get_mut(node_id) {
            Some(node) => {
                node.last_heartbeat = Instant::now();
                node.healthy = true;
                counter!("gateway_heartbeats_received_total", 1);
                true
            }
            None => false,
        }
    }

    /// Snapshot of every node that is healthy and within the eviction window.
    pub fn healthy_nodes(&self) -> Vec<NodeInfo> {
        let nodes = self.nodes();
        nodes
            .values()
            .filter(|node| node.healthy && !node.is_stale(self.eviction_timeout))
            .cloned()
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<NodeInfo> {
        self.nodes().get(node_id).cloned()
    }

    /// Atomically check health and take one load slot. Callers must not
    /// forward to the node when this returns false.
    pub fn increment_load(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes();
        match nodes.get_mut(node_id) {
            Some(node) if node.healthy => {
                node.current_load += 1;
                true
            }
            _ => false,
        }
    }

    /// Release one load slot, saturating at zero. A no-op for nodes that were
    /// evicted while the request was in flight.
    pub fn decrement_load(&self, node_id: &str) {
        let mut nodes = self.nodes();
        if let Some(node) = nodes.get_mut(node_id) {
            node.current_load = node.current_load.saturating_sub(1);
        }
    }

    /// One eviction pass: stale nodes become unhealthy, doubly-stale nodes
    /// are deleted.
    pub fn evict_stale(&self) {
        let mut nodes = self.nodes();
        let mut to_remove = Vec::new();
        for (node_id, node) in nodes.iter_mut() {
            if node.is_stale(self.eviction_timeout) {
                if node.healthy {
                    node.healthy = false;
                    warn!(node_id = %node_id, "Node marked unhealthy (stale heartbeat)");
                }
                if node.is_stale(self.eviction_timeout * 2) {
                    to_remove.push(node_id.clone());
                }
            }
        }
        for node_id in to_remove {
            nodes.remove(&node_id);
            counter!("gateway_nodes_evicted_total", 1);
            info!(node_id = %node_id, "Node evicted (no heartbeat)");
        }
        gauge!("gateway_registered_nodes", nodes.len() as f64);
    }

    pub fn stats(&self) -> RegistryStats {
        let nodes = self.nodes();
        let node_stats: Vec<NodeStats> = nodes
            .values()
            .map(|node| NodeStats {
                node_id: node.node_id.clone(),
                url: node.url.clone(),
                load: node.current_load,
                capacity: node.max_capacity,
                healthy: node.healthy,
            })
            .collect();
        RegistryStats {
            total_nodes: node_stats.len(),
            healthy_nodes: node_stats.iter().filter(|n| n.healthy).count(),
            nodes: node_stats,
        }
    }

    /// Background eviction loop ticking every `period` until cancelled.
    pub fn spawn_eviction_loop(
        self: std::sync::Arc<Self>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => registry.evict_stale(),
                }
            }
        })
    }
}
