//! Integration tests for the gateway: real axum servers on ephemeral ports,
//! stub inference nodes, and reqwest driving the public API.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use gateway_node::api::{create_api_router, AppState};
use gateway_node::config::GatewayConfig;
use serving_common::{
    InferenceRequest, InferenceResponse, RegisterRequest, API_KEY_HEADER, REQUEST_ID_HEADER,
};

const TEST_KEY: &str = "test-key";

fn test_config() -> GatewayConfig {
    GatewayConfig {
        api_keys: format!("acme:{TEST_KEY}"),
        gateway_timeout_ms: 2_000,
        ..GatewayConfig::default()
    }
}

async fn spawn_gateway(config: GatewayConfig) -> (SocketAddr, AppState) {
    let state = AppState::new(config).unwrap();
    let app = create_api_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

#[derive(Clone)]
struct StubNode {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
    delay: Duration,
    content_type: Option<&'static str>,
}

async fn stub_infer(
    State(stub): State<StubNode>,
    headers: HeaderMap,
    Json(request): Json<InferenceRequest>,
) -> Response {
    stub.calls.fetch_add(1, Ordering::SeqCst);
    if !stub.delay.is_zero() {
        tokio::time::sleep(stub.delay).await;
    }
    if let Some(content_type) = stub.content_type {
        return ([(axum::http::header::CONTENT_TYPE, content_type)], "data: hello\n\n")
            .into_response();
    }
    if stub.status.is_success() {
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        Json(InferenceResponse {
            api_version: "v1".to_string(),
            text: format!("echo: {}", request.prompt),
            request_id,
        })
        .into_response()
    } else {
        (stub.status, "boom").into_response()
    }
}

async fn spawn_stub_node(stub: StubNode) -> SocketAddr {
    let app = Router::new().route("/infer", post(stub_infer)).with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn ok_stub(calls: Arc<AtomicUsize>) -> StubNode {
    StubNode {
        calls,
        status: StatusCode::OK,
        delay: Duration::ZERO,
        content_type: None,
    }
}

fn failing_stub(calls: Arc<AtomicUsize>, status: StatusCode) -> StubNode {
    StubNode {
        calls,
        status,
        delay: Duration::ZERO,
        content_type: None,
    }
}

async fn register_node(gateway: SocketAddr, node_id: &str, node_addr: SocketAddr, capacity: u32) {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{gateway}/register"))
        .json(&RegisterRequest {
            node_id: node_id.to_string(),
            url: format!("http://{node_addr}"),
            max_capacity: capacity,
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

fn infer_body() -> serde_json::Value {
    json!({ "prompt": "hello fleet" })
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let response = reqwest::get(format!("http://{gateway}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn infer_requires_api_key() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("http://{gateway}/infer"))
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

    let invalid = client
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, "wrong-key")
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = invalid.json().await.unwrap();
    assert_eq!(body["detail"], "Invalid API key");
}

#[tokio::test]
async fn infer_without_nodes_returns_503() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "No inference nodes available");
}

#[tokio::test]
async fn infer_round_trips_through_registered_node() {
    let (gateway, state) = spawn_gateway(test_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(ok_stub(Arc::clone(&calls))).await;
    register_node(gateway, "node-a", node, 100).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .header(REQUEST_ID_HEADER, "trace-1")
        .json(&infer_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("trace-1")
    );
    let body: InferenceResponse = response.json().await.unwrap();
    assert_eq!(body.text, "echo: hello fleet");
    assert_eq!(body.request_id, "trace-1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Load slot released once the response is returned.
    assert_eq!(state.registry.get("node-a").unwrap().current_load, 0);
}

#[tokio::test]
async fn retry_selects_alternate_node_on_5xx() {
    let (gateway, _state) = spawn_gateway(test_config()).await;

    let failing_calls = Arc::new(AtomicUsize::new(0));
    let ok_calls = Arc::new(AtomicUsize::new(0));
    let failing = spawn_stub_node(failing_stub(
        Arc::clone(&failing_calls),
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
    .await;
    let healthy = spawn_stub_node(ok_stub(Arc::clone(&ok_calls))).await;

    // Equal capacity: the tie keeps node-a first, and the admission load slot
    // tips the retry selection to node-b.
    register_node(gateway, "node-a", failing, 100).await;
    register_node(gateway, "node-b", healthy, 100).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_4xx_surfaces_without_retry() {
    let (gateway, state) = spawn_gateway(test_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(failing_stub(Arc::clone(&calls), StatusCode::BAD_REQUEST)).await;
    register_node(gateway, "node-a", node, 100).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Client errors do not count toward the breaker.
    assert!(state
        .breaker
        .state("node-a")
        .map(|s| s.failures == 0)
        .unwrap_or(true));
    assert_eq!(state.registry.get("node-a").unwrap().current_load, 0);
}

#[tokio::test]
async fn repeated_5xx_opens_breaker_and_blocks_node() {
    let config = GatewayConfig {
        circuit_failure_threshold: 2,
        max_retries: 0,
        ..test_config()
    };
    let (gateway, state) = spawn_gateway(config).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(failing_stub(
        Arc::clone(&calls),
        StatusCode::INTERNAL_SERVER_ERROR,
    ))
    .await;
    register_node(gateway, "node-a", node, 100).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .post(format!("http://{gateway}/infer"))
            .header(API_KEY_HEADER, TEST_KEY)
            .json(&infer_body())
            .send()
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    // Breaker open: the node is no longer selectable.
    let blocked = client
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(state.metrics.circuit_breaker_opens(), 1);
    // Load slots were released on every error path.
    assert_eq!(state.registry.get("node-a").unwrap().current_load, 0);
}

#[tokio::test]
async fn upstream_timeout_maps_to_504() {
    let config = GatewayConfig {
        gateway_timeout_ms: 200,
        ..test_config()
    };
    let (gateway, _state) = spawn_gateway(config).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(StubNode {
        calls: Arc::clone(&calls),
        status: StatusCode::OK,
        delay: Duration::from_secs(2),
        content_type: None,
    })
    .await;
    register_node(gateway, "node-a", node, 100).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Request timeout");
}

#[tokio::test]
async fn tenant_rate_limit_enforced() {
    let config = GatewayConfig {
        tenant_rate_limit: 2,
        ..test_config()
    };
    let (gateway, state) = spawn_gateway(config).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(ok_stub(calls)).await;
    register_node(gateway, "node-a", node, 100).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .post(format!("http://{gateway}/infer"))
            .header(API_KEY_HEADER, TEST_KEY)
            .json(&infer_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    let limited = client
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(state.metrics.rate_limit_hits(), 1);

    // Health stays exempt even for a throttled caller.
    let health = reqwest::get(format!("http://{gateway}/health")).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn heartbeat_unknown_node_returns_404() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/heartbeat/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn register_rejects_zero_capacity() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/register"))
        .json(&json!({ "node_id": "node-a", "url": "http://127.0.0.1:1", "max_capacity": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stale_node_is_marked_unhealthy_then_evicted() {
    let config = GatewayConfig {
        node_eviction_timeout_sec: 1,
        heartbeat_interval_sec: 1,
        ..test_config()
    };
    let (gateway, state) = spawn_gateway(config).await;
    let token = CancellationToken::new();
    let eviction = Arc::clone(&state.registry)
        .spawn_eviction_loop(Duration::from_millis(200), token.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(ok_stub(calls)).await;
    register_node(gateway, "node-a", node, 100).await;

    // No heartbeats: past the eviction timeout the node stops being selectable.
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

    // Past twice the timeout the registry entry is deleted.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(state.registry.get("node-a").is_none());

    token.cancel();
    let _ = eviction.await;
}

#[tokio::test]
async fn metrics_endpoint_exposes_snapshot() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let _ = reqwest::get(format!("http://{gateway}/health")).await.unwrap();

    let response = reqwest::get(format!("http://{gateway}/metrics")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body.get("requests_total").is_some());
    assert!(body.get("errors_total").is_some());
    assert!(body.get("rate_limit_hits_total").is_some());
    assert!(body.get("circuit_breaker_opens_total").is_some());
    assert!(body.get("latency_avg_seconds").is_some());
    assert!(body["requests_total"].get("/health_200").is_some());
}

#[tokio::test]
async fn streaming_disabled_returns_503() {
    let (gateway, _state) = spawn_gateway(test_config()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer/stream"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Streaming is not enabled");
}

#[tokio::test]
async fn streaming_proxies_node_bytes_opaquely() {
    let config = GatewayConfig {
        enable_streaming: true,
        ..test_config()
    };
    let (gateway, state) = spawn_gateway(config).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let node = spawn_stub_node(StubNode {
        calls: Arc::clone(&calls),
        status: StatusCode::OK,
        delay: Duration::ZERO,
        content_type: Some("text/event-stream"),
    })
    .await;
    register_node(gateway, "node-a", node, 100).await;

    let response = reqwest::Client::new()
        .post(format!("http://{gateway}/infer/stream"))
        .header(API_KEY_HEADER, TEST_KEY)
        .json(&infer_body())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = response.text().await.unwrap();
    assert!(body.contains("data: hello"));

    // The load slot is released when the gateway drops the finished stream.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(state.registry.get("node-a").unwrap().current_load, 0);
}
