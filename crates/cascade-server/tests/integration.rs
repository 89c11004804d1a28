use std::sync::Arc;

use axum::http::StatusCode;
use cascade_client::ReqwestFetcher;
use cascade_context::TRANSACTION_HEADER;
use cascade_engine::ActionDispatcher;
use cascade_sandbox::{SandboxConfig, SandboxExecutor};
use cascade_server::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app() -> axum::Router {
    let dispatcher = ActionDispatcher::new(
        Arc::new(SandboxExecutor::new(SandboxConfig::default())),
        Arc::new(ReqwestFetcher::new().unwrap()),
    );
    build_router(AppState::new(dispatcher))
}

struct Reply {
    status: StatusCode,
    transaction: Option<String>,
    body: Value,
}

async fn send(app: axum::Router, req: axum::http::Request<axum::body::Body>) -> Reply {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let transaction = response
        .headers()
        .get(TRANSACTION_HEADER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    Reply {
        status,
        transaction,
        body,
    }
}

fn execute_request(body: impl Into<axum::body::Body>) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/execute")
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

async fn execute(body: Value) -> Reply {
    send(app(), execute_request(serde_json::to_vec(&body).unwrap())).await
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_is_ok() {
    let req = axum::http::Request::builder()
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let reply = send(app(), req).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn code_action_round_trip() {
    let reply = execute(json!([{ "type": "code", "source": "return 1+1;" }])).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({ "results": [2] }));
}

#[tokio::test]
async fn empty_batch_is_ok() {
    let reply = execute(json!([])).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({ "results": [] }));
}

#[tokio::test]
async fn unknown_kind_is_a_result_entry() {
    let reply = execute(json!([
        { "type": "frobnicate" },
        { "type": "code", "source": "return 'after';" },
    ]))
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.body,
        json!({ "results": [{ "error": "Unknown action type: frobnicate" }, "after"] })
    );
}

#[tokio::test]
async fn non_array_body_is_rejected_without_side_effects() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let reply = execute(json!({ "type": "http", "url": server.uri() })).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        reply.body,
        json!({ "error": "Request body must be an array of actions" })
    );
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let reply = send(app(), execute_request("[{")).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    let message = reply.body["error"].as_str().unwrap();
    assert!(message.starts_with("Invalid JSON body:"), "{message}");
}

#[tokio::test]
async fn malformed_action_is_rejected() {
    let reply = execute(json!([{ "type": "code" }])).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.body["error"].as_str().unwrap().starts_with("action 0:"));
}

#[tokio::test]
async fn script_error_is_a_500() {
    let reply = execute(json!([
        { "type": "code", "source": "return 1;" },
        { "type": "code", "source": "throw new Error('boom');" },
    ]))
    .await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    let message = reply.body["error"].as_str().unwrap();
    assert!(message.contains("boom"), "{message}");
    assert!(reply.body.get("results").is_none());
}

#[tokio::test]
async fn unreachable_target_is_a_500() {
    let reply = execute(json!([{ "type": "http", "url": "http://127.0.0.1:1/" }])).await;
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reply.body["error"].is_string());
}

// ---------------------------------------------------------------------------
// Transaction id
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbound_transaction_is_echoed_and_forwarded() {
    let server = MockServer::start().await;
    Mock::given(header(TRANSACTION_HEADER, "feedbeef-0000-4000-8000-000000000001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "results": [1, 2, 3] })))
        .expect(1)
        .mount(&server)
        .await;

    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/v1/execute")
        .header(TRANSACTION_HEADER, "feedbeef-0000-4000-8000-000000000001")
        .body(axum::body::Body::from(
            serde_json::to_vec(&json!([{ "type": "http", "url": server.uri() }])).unwrap(),
        ))
        .unwrap();
    let reply = send(app(), req).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!({ "results": [[1, 2, 3]] }));
    assert_eq!(
        reply.transaction.as_deref(),
        Some("feedbeef-0000-4000-8000-000000000001")
    );
}

#[tokio::test]
async fn transaction_is_generated_when_absent() {
    let a = execute(json!([])).await.transaction.unwrap();
    let b = execute(json!([])).await.transaction.unwrap();
    assert_eq!(a.len(), 36, "{a}");
    assert_ne!(a, b);
}

#[tokio::test]
async fn errors_carry_the_transaction_too() {
    let reply = execute(json!("nope")).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert!(reply.transaction.is_some());
}
