use std::sync::Arc;

use tracing::debug;

use crate::circuit::CircuitBreaker;
use crate::registry::{NodeInfo, NodeRegistry};

/// Load-aware node selection over healthy, non-tripped nodes.
#[derive(Debug, Clone)]
pub struct NodeSelector {
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
}

impl NodeSelector {
    pub fn new(registry: Arc<NodeRegistry>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { registry, breaker }
    }

    /// Pick the selectable node with the most available capacity.
    ///
    /// Ties keep the first candidate in registry order. Returns `None` when
    /// no healthy node has a closed (or probing) circuit.
    pub fn select_node(&self) -> Option<NodeInfo> {
        let mut best: Option<NodeInfo> = None;
        for node in self.registry.healthy_nodes() {
            if !self.breaker.is_available(&node.node_id) {
                debug!(node_id = %node.node_id, "Skipping node with open circuit");
                continue;
            }
            match &best {
                Some(current) if node.available_capacity() <= current.available_capacity() => {}
                _ => best = Some(node),
            }
        }
        best
    }
}
