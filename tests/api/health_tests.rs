//! Health and metrics endpoints through `axum-test`

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;

use realtime_server::infrastructure::pubsub::PubSubBroker;
use realtime_server::presentation::http::routes::create_router;
use realtime_server::startup::AppState;

use crate::common::test_settings;

async fn server() -> (TestServer, AppState) {
    let broker = Arc::new(PubSubBroker::in_memory().await);
    let state = AppState::new(test_settings(), broker);
    let server = TestServer::new(create_router(state.clone())).expect("Failed to start test server");
    (server, state)
}

#[tokio::test]
async fn test_health_check_returns_ok() {
    let (server, _) = server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_liveness_probe() {
    let (server, _) = server().await;

    let response = server.get("/health/live").await;

    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "alive");
}

#[tokio::test]
async fn test_readiness_reports_backend_and_connections() {
    let (server, state) = server().await;
    let (_connection, _outbound) = state
        .tcp
        .manager()
        .add_connection("127.0.0.1:50000".parse().unwrap())
        .unwrap();

    let response = server.get("/health/ready").await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pubsub"]["backend"], "memory");
    assert_eq!(body["pubsub"]["connected"], true);
    assert_eq!(body["pubsub"]["fallbackActive"], false);
    assert_eq!(body["transports"]["tcp"]["connections"], 1);
    assert_eq!(body["transports"]["websocket"]["connections"], 0);
}

#[tokio::test]
async fn test_readiness_unavailable_when_broker_disconnected() {
    let (server, state) = server().await;
    state.broker.disconnect().await.unwrap();

    let response = server.get("/health/ready").await;

    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["status"], "unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_prometheus_text() {
    let (server, state) = server().await;
    let _ = state
        .websocket
        .manager()
        .add_connection("127.0.0.1:50001".parse().unwrap())
        .unwrap();

    let response = server.get("/metrics").await;

    response.assert_status_ok();
    assert!(response.text().contains("realtime_connections_active"));
}
