use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the gateway request path.
///
/// Every variant maps to a concrete HTTP status; handlers return
/// `Result<_, GatewayError>` and the `IntoResponse` impl renders the
/// `{"detail": ...}` body clients see.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request arrived without an API key
    #[error("Missing X-API-Key header")]
    MissingApiKey,

    /// API key not present in the tenant map
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Tenant exhausted its sliding-window budget
    #[error("Rate limit exceeded: {0} requests per minute")]
    RateLimited(u32),

    /// No node passed selection at admission
    #[error("No inference nodes available")]
    NoNodesAvailable,

    /// Every forwarding attempt failed at the transport level
    #[error("No healthy nodes available")]
    NoHealthyNodes,

    /// The forwarded call exceeded the gateway timeout
    #[error("Request timeout")]
    UpstreamTimeout,

    /// The node answered with a non-2xx status that is surfaced verbatim
    #[error("Node error: {body}")]
    Upstream { status: u16, body: String },

    /// A 2xx node response failed to parse as an InferenceResponse
    #[error("Invalid response from inference node")]
    InvalidNodeResponse,

    /// Streaming endpoint hit while ENABLE_STREAMING is off
    #[error("Streaming is not enabled")]
    StreamingDisabled,

    /// Registration payload failed validation
    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    /// Heartbeat for a node the registry does not know
    #[error("Node not found")]
    UnknownNode,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::MissingApiKey | GatewayError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoNodesAvailable | GatewayError::NoHealthyNodes => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::InvalidNodeResponse => StatusCode::BAD_GATEWAY,
            GatewayError::StreamingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownNode => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}
