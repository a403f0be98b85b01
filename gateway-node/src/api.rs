use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use futures::StreamExt;
use reqwest::Client;
use serving_common::{
    InferenceRequest, InferenceResponse, RegisterRequest, StatusResponse, API_KEY_HEADER,
    REQUEST_ID_HEADER,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::ApiKeyMap;
use crate::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::forward::Forwarder;
use crate::metrics::{GatewayMetrics, MetricsSnapshot};
use crate::rate_limit::TenantRateLimiter;
use crate::registry::NodeRegistry;
use crate::router::NodeSelector;

/// Request identifier minted or echoed by the observability middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Tenant attached to the request by the auth middleware.
#[derive(Debug, Clone)]
pub struct TenantId(pub String);

/// Gateway application state shared by handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<NodeRegistry>,
    pub breaker: Arc<CircuitBreaker>,
    pub limiter: Arc<TenantRateLimiter>,
    pub auth: Arc<ApiKeyMap>,
    pub metrics: Arc<GatewayMetrics>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let metrics = Arc::new(GatewayMetrics::new());
        let registry = Arc::new(NodeRegistry::new(config.eviction_timeout()));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                recovery_timeout: config.circuit_recovery_timeout(),
                half_open_max_attempts: config.circuit_half_open_max_attempts,
            },
            Arc::clone(&metrics),
        ));
        let selector = NodeSelector::new(Arc::clone(&registry), Arc::clone(&breaker));
        let client = Client::builder()
            .timeout(config.forward_timeout())
            .build()
            .context("Failed to build HTTP client")?;
        let forwarder = Forwarder::new(
            client,
            Arc::clone(&registry),
            selector,
            Arc::clone(&breaker),
            config.forward_timeout(),
            config.max_retries,
        );
        let limiter = Arc::new(TenantRateLimiter::per_minute(config.tenant_rate_limit));
        let auth = Arc::new(ApiKeyMap::new(config.api_key_map()));

        Ok(Self {
            config,
            registry,
            breaker,
            limiter,
            auth,
            metrics,
            forwarder,
        })
    }
}

/// Paths the auth and rate-limit middleware skip: health, the registration
/// plane (nodes carry no API key), and the metrics snapshot.
fn is_exempt_path(path: &str) -> bool {
    matches!(path, "/health" | "/register" | "/metrics") || path.starts_with("/heartbeat/")
}

/// Build the gateway router with all endpoints and middleware.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/register", post(register_node))
        .route("/heartbeat/:node_id", post(node_heartbeat))
        .route("/infer", post(infer))
        .route("/infer/stream", post(infer_stream))
        .route("/metrics", get(metrics_snapshot))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            observability_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Echo or mint `X-Request-ID`, time the request, and record it.
async fn observability_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let method = request.method().clone();
    let endpoint = request.uri().path().to_string();
    let start = Instant::now();

    info!(
        request_id = %request_id,
        method = %method,
        endpoint = %endpoint,
        "Request started"
    );

    let mut response = next.run(request).await;
    let elapsed = start.elapsed();
    state
        .metrics
        .record_request(&endpoint, response.status().as_u16(), elapsed);

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    info!(
        request_id = %request_id,
        status = response.status().as_u16(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Request completed"
    );
    response
}

/// Resolve `X-API-Key` to a tenant and stash it in request extensions.
async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if is_exempt_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let Some(api_key) = api_key else {
        warn!("Request missing X-API-Key header");
        return Err(GatewayError::MissingApiKey);
    };

    let Some(tenant_id) = state.auth.tenant_for(&api_key) else {
        warn!("Invalid API key presented");
        return Err(GatewayError::InvalidApiKey);
    };

    request
        .extensions_mut()
        .insert(TenantId(tenant_id.to_string()));
    Ok(next.run(request).await)
}

/// Sliding-window admission per tenant.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    if is_exempt_path(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    if let Some(tenant) = request.extensions().get::<TenantId>() {
        if !state.limiter.check(&tenant.0) {
            state.metrics.record_rate_limit();
            return Err(GatewayError::RateLimited(state.limiter.limit()));
        }
    }
    Ok(next.run(request).await)
}

async fn health_check() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

#[instrument(skip(state))]
async fn register_node(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<StatusResponse>, GatewayError> {
    state
        .registry
        .register(&request.node_id, &request.url, request.max_capacity)?;
    Ok(Json(StatusResponse::registered()))
}

#[instrument(skip(state))]
async fn node_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    if state.registry.heartbeat(&node_id) {
        Ok(Json(StatusResponse::ok()))
    } else {
        warn!(node_id = %node_id, "Heartbeat from unknown node");
        Err(GatewayError::UnknownNode)
    }
}

#[instrument(skip(state, request))]
async fn infer(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, GatewayError> {
    let response = state.forwarder.forward(&request, &request_id.0).await?;
    Ok(Json(response))
}

/// Opaque byte proxy to a node's streaming endpoint. The load slot is held
/// until the client finishes (or abandons) the stream.
#[instrument(skip(state, request))]
async fn infer_stream(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<InferenceRequest>,
) -> Result<Response, GatewayError> {
    if !state.config.enable_streaming {
        return Err(GatewayError::StreamingDisabled);
    }

    let (upstream, guard) = state
        .forwarder
        .forward_stream(&request, &request_id.0)
        .await?;
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let stream = upstream.bytes_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });
    let mut response = Response::new(Body::from_stream(stream));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}

async fn metrics_snapshot(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
