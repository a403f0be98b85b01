//! Shared wire types for the inference serving plane.
//!
//! Both tiers speak the same JSON payloads: clients submit an
//! [`InferenceRequest`] to the gateway, the gateway forwards it verbatim to a
//! node, and the node answers with an [`InferenceResponse`]. Registration and
//! heartbeat payloads for the fleet membership plane live here as well.

use serde::{Deserialize, Serialize};

/// Wire protocol version stamped on every inference payload.
pub const API_VERSION: &str = "v1";

/// Default token budget applied when a request omits `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 100;

/// Default sampling temperature applied when a request omits `temperature`.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Header carrying the request identifier across tiers.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Header carrying the client API key on gateway inference calls.
pub const API_KEY_HEADER: &str = "X-API-Key";

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_max_tokens() -> Option<u32> {
    Some(DEFAULT_MAX_TOKENS)
}

fn default_temperature() -> Option<f64> {
    Some(DEFAULT_TEMPERATURE)
}

/// A single inference call as submitted by a client.
///
/// Unknown fields are rejected so that client typos surface as errors instead
/// of being silently dropped. `max_tokens` and `temperature` default when
/// omitted; an explicit `null` reaches the worker, which re-applies the same
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InferenceRequest {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Input prompt text.
    pub prompt: String,
    /// Maximum tokens to generate.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: Option<f64>,
}

impl InferenceRequest {
    /// Build a request with default sampling parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            api_version: default_api_version(),
            prompt: prompt.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// The completed result of one inference call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InferenceResponse {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Generated text.
    pub text: String,
    /// Request identifier for tracing.
    pub request_id: String,
}

/// Payload a node POSTs to `gateway/register` on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Unique node identifier.
    pub node_id: String,
    /// Base URL the gateway forwards inference calls to.
    pub url: String,
    /// Concurrent-request ceiling advertised by the node.
    pub max_capacity: u32,
}

/// Status acknowledgement returned by the membership endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }

    pub fn registered() -> Self {
        Self {
            status: "registered".to_string(),
        }
    }
}
