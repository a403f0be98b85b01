use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors produced inside the inference pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Admission queue at capacity
    #[error("Request queue full, backpressure applied")]
    QueueFull,

    /// Model generation failed for one request
    #[error("Generation failed: {0}")]
    Generate(String),

    /// Pipeline is stopping; the request was not processed
    #[error("Node is shutting down")]
    ShuttingDown,

    /// The completion handle was dropped before a result arrived
    #[error("Request was cancelled before completion")]
    Cancelled,
}

impl NodeError {
    pub fn status(&self) -> StatusCode {
        match self {
            NodeError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NodeError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
            NodeError::Generate(_) => StatusCode::INTERNAL_SERVER_ERROR,
            NodeError::ShuttingDown | NodeError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            NodeError::QueueFull => {
                "Request limit exceeded, please try again later".to_string()
            }
            NodeError::Generate(message) => format!("Inference error: {message}"),
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}
