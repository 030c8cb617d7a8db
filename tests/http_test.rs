//! Integration tests for the health router.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Script, test_options, test_pool};
use db_resilience::db::{QueryExecutor, QueryOutput, ReadinessState};
use db_resilience::http::{CORRELATION_ID_HEADER, HealthState, router};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn app(script: &Script, readiness: Arc<ReadinessState>) -> Router {
    let pool = test_pool(script, test_options(2));
    let executor = QueryExecutor::new(pool);
    router(Arc::new(HealthState::new(readiness, executor)))
}

async fn get(app: Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_live_is_always_ok() {
    let script = Script::new();
    let (status, _, body) = get(app(&script, Arc::new(ReadinessState::new())), "/health/live").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");
}

#[tokio::test]
async fn test_ready_follows_state_without_touching_pool() {
    let script = Script::new();
    let readiness = Arc::new(ReadinessState::new());

    let (status, _, body) = get(app(&script, Arc::clone(&readiness)), "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    readiness.mark_ready();
    let (status, _, body) = get(app(&script, Arc::clone(&readiness)), "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    assert!(script.events().is_empty());
}

#[tokio::test]
async fn test_ready_reports_draining_once_shutdown_starts() {
    let script = Script::new();
    let readiness = Arc::new(ReadinessState::new());
    readiness.mark_ready();
    let token = CancellationToken::new();
    let app = {
        let executor = QueryExecutor::new(test_pool(&script, test_options(2)));
        let state = HealthState::new(Arc::clone(&readiness), executor).with_shutdown(token.clone());
        router(Arc::new(state))
    };

    let (status, _, body) = get(app.clone(), "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");

    token.cancel();
    let (status, _, body) = get(app, "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "draining");
    assert!(readiness.is_ready());
}

#[tokio::test]
async fn test_pool_status() {
    let script = Script::new();
    let (status, _, body) = get(app(&script, Arc::new(ReadinessState::new())), "/health/pool").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_connections"], 2);
    assert_eq!(body["leased"], 0);
    assert_eq!(body["closed"], false);
}

#[tokio::test]
async fn test_db_check_ok() {
    let script = Script::new();
    script.push_ok(QueryOutput::Scalar(Some(json!(1))));

    let (status, _, body) = get(app(&script, Arc::new(ReadinessState::new())), "/health/db").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(script.run_ids(), vec![0]);
}

#[tokio::test]
async fn test_db_check_transient_failure_is_503_with_generic_body() {
    let script = Script::new();
    for _ in 0..3 {
        script.push_fail("terminating connection due to administrator command");
    }

    let (status, headers, body) =
        get(app(&script, Arc::new(ReadinessState::new())), "/health/db").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Service temporarily unavailable");
    assert_eq!(
        headers[CORRELATION_ID_HEADER].to_str().unwrap(),
        body["correlation_id"].as_str().unwrap()
    );
    assert!(!body.to_string().contains("administrator"));
}

#[tokio::test]
async fn test_db_check_fatal_failure_is_500_without_driver_text() {
    let script = Script::new();
    script.push_fail("permission denied for table pg_authid");

    let (status, _, body) = get(app(&script, Arc::new(ReadinessState::new())), "/health/db").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Internal server error");
    assert!(!body.to_string().contains("pg_authid"));
    assert_eq!(script.run_ids().len(), 1);
}
