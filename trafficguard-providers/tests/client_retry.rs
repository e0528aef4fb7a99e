#![cfg(feature = "hetzner")]

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use trafficguard_common::ApiError;
use trafficguard_providers::hetzner::{HetznerClient, HetznerConfig};
use trafficguard_providers::ServerProvider;

struct StubState {
    hits: AtomicUsize,
    /// Respond 429 for this many hits before succeeding.
    rate_limit_first: usize,
}

impl StubState {
    fn new(rate_limit_first: usize) -> Arc<Self> {
        Arc::new(Self {
            hits: AtomicUsize::new(0),
            rate_limit_first,
        })
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn fast_config(api_base: String) -> HetznerConfig {
    let mut config = HetznerConfig::new("test-token");
    config.api_base = api_base;
    config.retry_budget = 3;
    config.backoff_base = Duration::from_millis(10);
    config.backoff_cap = Duration::from_millis(40);
    config.transient_backoff_base = Duration::from_millis(5);
    config.request_timeout = Duration::from_millis(200);
    config.connect_timeout = Duration::from_millis(200);
    config
}

fn server_body() -> Value {
    json!({
        "server": {
            "id": 1,
            "name": "web-1",
            "status": "running",
            "server_type": { "name": "cx23", "cores": 2 },
            "outgoing_traffic": 10,
        }
    })
}

async fn rate_limited_get_server(State(state): State<Arc<StubState>>) -> axum::response::Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    if hit < state.rate_limit_first {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": { "code": "rate_limit_exceeded", "message": "rate limit exceeded" } })),
        )
            .into_response()
    } else {
        Json(server_body()).into_response()
    }
}

async fn not_found_get_server(State(state): State<Arc<StubState>>) -> axum::response::Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "code": "not_found", "message": "server not found" } })),
    )
        .into_response()
}

async fn stalled_get_server(State(state): State<Arc<StubState>>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(server_body())
}

async fn error_object_action(State(state): State<Arc<StubState>>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    // Hetzner occasionally reports failures inside an HTTP 200.
    Json(json!({ "error": { "code": "invalid_input", "message": "invalid input in field 'server_type'" } }))
}

async fn accepted_action(State(state): State<Arc<StubState>>) -> Json<Value> {
    state.hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "action": { "id": 7, "command": "poweroff", "status": "running" } }))
}

#[tokio::test]
async fn rate_limited_then_success_stays_within_budget() {
    let state = StubState::new(2);
    let app = Router::new()
        .route("/servers/:id", get(rate_limited_get_server))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    let server = client.get_server(1).await.unwrap();

    assert_eq!(server.server_type, "cx23");
    assert_eq!(state.hits(), 3);
}

#[tokio::test]
async fn rate_limit_on_every_attempt_exhausts_the_budget() {
    let state = StubState::new(usize::MAX);
    let app = Router::new()
        .route("/servers/:id", get(rate_limited_get_server))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    let err = client.get_server(1).await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(state.hits(), 3);
}

#[tokio::test]
async fn client_error_is_terminal_without_retry() {
    let state = StubState::new(0);
    let app = Router::new()
        .route("/servers/:id", get(not_found_get_server))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    let err = client.get_server(1).await.unwrap_err();

    match err {
        ApiError::Provider { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("not_found"));
        }
        other => panic!("expected Provider error, got {other:?}"),
    }
    assert_eq!(state.hits(), 1);
}

#[tokio::test]
async fn per_attempt_timeout_exhausts_retry_budget() {
    let state = StubState::new(0);
    let app = Router::new()
        .route("/servers/:id", get(stalled_get_server))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    let err = client.get_server(1).await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::RetriesExhausted { attempts: 3, .. }
    ));
    // Exactly one request per attempt, never an infinite loop.
    assert_eq!(state.hits(), 3);
}

#[tokio::test]
async fn error_object_in_ok_response_is_normalized() {
    let state = StubState::new(0);
    let app = Router::new()
        .route("/servers/:id/actions/change_type", post(error_object_action))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    let err = client.change_server_type(1, "cx33", false).await.unwrap_err();

    match err {
        ApiError::Provider { message, .. } => {
            assert!(message.contains("invalid input"));
        }
        other => panic!("expected Provider error, got {other:?}"),
    }
    // Provider-reported errors are non-transient: one attempt only.
    assert_eq!(state.hits(), 1);
}

#[tokio::test]
async fn power_off_posts_to_the_action_path() {
    let state = StubState::new(0);
    let app = Router::new()
        .route("/servers/:id/actions/poweroff", post(accepted_action))
        .with_state(state.clone());
    let base = spawn_stub(app).await;

    let client = HetznerClient::new(fast_config(base)).unwrap();
    client.power_off(1).await.unwrap();
    assert_eq!(state.hits(), 1);
}
