use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serving_common::{InferenceRequest, InferenceResponse, REQUEST_ID_HEADER};
use tracing::{info, warn};

use crate::circuit::CircuitBreaker;
use crate::error::GatewayError;
use crate::registry::{NodeInfo, NodeRegistry};
use crate::router::NodeSelector;

/// Releases one load slot on the originally selected node when dropped.
///
/// Only the admission-time acquisition is released: retries that move to a
/// different node do not take new slots, so the in-flight count tracks
/// request admissions rather than attempts.
pub struct LoadGuard {
    registry: Arc<NodeRegistry>,
    node_id: String,
}

impl LoadGuard {
    pub fn new(registry: Arc<NodeRegistry>, node_id: String) -> Self {
        Self { registry, node_id }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.registry.decrement_load(&self.node_id);
    }
}

enum LastFailure {
    None,
    Timeout,
    Transport,
}

/// The gateway's retry-aware call path to the node fleet.
#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    registry: Arc<NodeRegistry>,
    selector: NodeSelector,
    breaker: Arc<CircuitBreaker>,
    forward_timeout: Duration,
    max_retries: u32,
}

impl Forwarder {
    pub fn new(
        client: Client,
        registry: Arc<NodeRegistry>,
        selector: NodeSelector,
        breaker: Arc<CircuitBreaker>,
        forward_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            client,
            registry,
            selector,
            breaker,
            forward_timeout,
            max_retries,
        }
    }

    /// Forward one inference request and parse the node's response.
    pub async fn forward(
        &self,
        request: &InferenceRequest,
        request_id: &str,
    ) -> Result<InferenceResponse, GatewayError> {
        let (response, _guard) = self.dispatch(request, request_id, false).await?;
        response
            .json::<InferenceResponse>()
            .await
            .map_err(|_| GatewayError::InvalidNodeResponse)
    }

    /// Forward one streaming inference request, handing the raw upstream
    /// response (and the load guard keeping the slot held) to the caller.
    pub async fn forward_stream(
        &self,
        request: &InferenceRequest,
        request_id: &str,
    ) -> Result<(reqwest::Response, LoadGuard), GatewayError> {
        self.dispatch(request, request_id, true).await
    }

    async fn dispatch(
        &self,
        request: &InferenceRequest,
        request_id: &str,
        stream: bool,
    ) -> Result<(reqwest::Response, LoadGuard), GatewayError> {
        let node = self
            .selector
            .select_node()
            .ok_or(GatewayError::NoNodesAvailable)?;
        if !self.registry.increment_load(&node.node_id) {
            warn!(node_id = %node.node_id, "Node became unhealthy during selection");
            return Err(GatewayError::NoNodesAvailable);
        }
        let guard = LoadGuard::new(Arc::clone(&self.registry), node.node_id.clone());

        let start = Instant::now();
        let response = self.attempt_loop(node, request, request_id, stream).await?;
        info!(
            request_id = %request_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request forwarded"
        );
        Ok((response, guard))
    }

    /// Up to `1 + max_retries` attempts, reselecting on retryable failures.
    ///
    /// Retry classes: transport timeout, transport error, upstream 5xx. A 4xx
    /// surfaces immediately and does not count against the breaker.
    async fn attempt_loop(
        &self,
        mut node: NodeInfo,
        request: &InferenceRequest,
        request_id: &str,
        stream: bool,
    ) -> Result<reqwest::Response, GatewayError> {
        let mut attempt: u32 = 0;
        let mut last_failure = LastFailure::None;

        loop {
            if !self.breaker.is_available(&node.node_id) {
                warn!(node_id = %node.node_id, "Circuit breaker open, skipping node");
                if attempt >= self.max_retries {
                    break;
                }
                attempt += 1;
                match self.selector.select_node() {
                    Some(next) if self.breaker.is_available(&next.node_id) => {
                        node = next;
                        continue;
                    }
                    _ => break,
                }
            }

            let url = format!("{}/infer", node.url.trim_end_matches('/'));
            let mut builder = self
                .client
                .post(&url)
                .json(request)
                .header(REQUEST_ID_HEADER, request_id)
                .timeout(self.forward_timeout);
            if stream {
                builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
            }

            match builder.send().await {
                Ok(response) if response.status().is_success() => {
                    self.breaker.record_success(&node.node_id);
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        self.breaker.record_failure(&node.node_id);
                        warn!(
                            node_id = %node.node_id,
                            status = status.as_u16(),
                            attempt = attempt + 1,
                            "Node returned server error"
                        );
                        if attempt < self.max_retries {
                            attempt += 1;
                            match self.selector.select_node() {
                                Some(next) => {
                                    node = next;
                                    continue;
                                }
                                None => break,
                            }
                        }
                    }
                    let body = response.text().await.unwrap_or_default();
                    return Err(GatewayError::Upstream {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    self.breaker.record_failure(&node.node_id);
                    last_failure = if err.is_timeout() {
                        LastFailure::Timeout
                    } else {
                        LastFailure::Transport
                    };
                    warn!(
                        node_id = %node.node_id,
                        error = %err,
                        attempt = attempt + 1,
                        "Forwarded request failed"
                    );
                    if attempt < self.max_retries {
                        attempt += 1;
                        match self.selector.select_node() {
                            Some(next) => {
                                node = next;
                                continue;
                            }
                            None => break,
                        }
                    }
                    break;
                }
            }
        }

        match last_failure {
            LastFailure::Timeout => Err(GatewayError::UpstreamTimeout),
            LastFailure::Transport | LastFailure::None => Err(GatewayError::NoHealthyNodes),
        }
    }
}
