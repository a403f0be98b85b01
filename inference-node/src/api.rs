use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use chrono::Utc;
use metrics::counter;
use serde_json::json;
use serving_common::{InferenceRequest, InferenceResponse, REQUEST_ID_HEADER};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::pipeline::InferencePipeline;

/// Request identifier minted or echoed by the middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Node application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub pipeline: Arc<InferencePipeline>,
}

impl AppState {
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let pipeline = Arc::new(InferencePipeline::new(&config));
        Ok(Self {
            config: Arc::new(config),
            pipeline,
        })
    }
}

/// Build the node router.
pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/infer", post(infer))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Echo or mint `X-Request-ID` and stamp it on the response.
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[instrument(skip(state, request))]
async fn infer(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceResponse>, NodeError> {
    counter!("node_requests_total", 1);
    info!(
        request_id = %request_id.0,
        prompt_length = request.prompt.len(),
        "Received inference request"
    );

    let response = state.pipeline.submit(request, request_id.0).await?;
    info!(response_length = response.text.len(), "Inference completed");
    Ok(Json(response))
}
