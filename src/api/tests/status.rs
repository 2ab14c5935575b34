use std::sync::Arc;

use axum::http::StatusCode;

use crate::api::test_helpers::{create_test_app, get_json, state_with_engine};
use crate::api::*;
use crate::engine::DemoEngine;
use crate::warmup::WarmupStatus;

#[tokio::test]
async fn test_root_reports_batch_mode() {
    let app = create_test_app();
    let (status, body) = get_json(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({"status": "batch"}));
}

#[tokio::test]
async fn test_health_report() {
    let app = create_test_app();
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["total_requests"], 0);
}

#[tokio::test]
async fn test_not_ready_returns_503() {
    let state = state_with_engine(Arc::new(DemoEngine::new()));
    state.health().set_status(WarmupStatus::InProgress);
    let app = create_router(state);

    let (status, body) = get_json(&app, "/").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().is_some());

    // Health stays reachable while warming up
    let (status, body) = get_json(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let app = create_test_app();
    let (status, _) = get_json(&app, "/v1/models").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
