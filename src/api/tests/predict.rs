use std::sync::Arc;

use axum::http::StatusCode;

use crate::api::test_helpers::{create_test_app, post_predict, state_with_engine};
use crate::api::*;
use crate::engine::DemoEngine;

#[tokio::test]
async fn test_single_prompt_returns_single_string() {
    let app = create_test_app();
    let (status, body) = post_predict(&app, r#"{"prompt": "2+2="}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "2+2=");
}

#[tokio::test]
async fn test_list_prompt_returns_aligned_list() {
    let app = create_test_app();
    let (status, body) = post_predict(&app, r#"{"prompt": ["a", "b", "c"]}"#).await;
    assert_eq!(status, StatusCode::OK);
    let items = body["response"].as_array().expect("list");
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], "a");
    assert_eq!(items[1], "b");
    assert_eq!(items[2], "c");
}

#[tokio::test]
async fn test_single_element_list_stays_a_list() {
    let app = create_test_app();
    let (_, body) = post_predict(&app, r#"{"prompt": ["only"]}"#).await;
    assert_eq!(body["response"], serde_json::json!(["only"]));
}

#[tokio::test]
async fn test_empty_list_skips_engine() {
    let engine = Arc::new(DemoEngine::new());
    let app = create_router(state_with_engine(engine.clone()));

    let (status, body) = post_predict(&app, r#"{"prompt": []}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], serde_json::json!([]));
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_one_engine_call_per_request() {
    let engine = Arc::new(DemoEngine::new());
    let app = create_router(state_with_engine(engine.clone()));

    post_predict(&app, r#"{"prompt": ["a", "b", "c", "d"]}"#).await;
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn test_repeated_request_is_deterministic() {
    let state = AppState::demo();
    let app = create_router(state.clone());
    let body = r#"{"prompt": ["What is Rust?", "2+2=", "What is Rust?"]}"#;

    let (_, first) = post_predict(&app, body).await;
    let (_, second) = post_predict(&app, body).await;
    assert_eq!(first, second);
    assert_eq!(first["response"][0], first["response"][2]);

    // Repeated messages hit the prompt cache
    let stats = state.formatter().stats();
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.hits, 4);
}

#[tokio::test]
async fn test_successes_are_counted() {
    let state = AppState::demo();
    let app = create_router(state.clone());
    post_predict(&app, r#"{"prompt": "x"}"#).await;
    post_predict(&app, r#"{"prompt": "y"}"#).await;
    assert_eq!(state.health().total_requests(), 2);
    assert_eq!(state.health().failed_requests(), 0);
}

#[test]
fn test_texts_shape_helpers() {
    let one: Texts = serde_json::from_str(r#""hi""#).expect("parse");
    assert!(!one.is_batch());
    assert_eq!(one.len(), 1);
    assert_eq!(one.into_vec(), vec!["hi"]);

    let many: Texts = serde_json::from_str(r#"["a", "b"]"#).expect("parse");
    assert!(many.is_batch());
    assert_eq!(many.len(), 2);

    let empty = Texts::Many(Vec::new());
    assert!(empty.is_empty());

    assert_eq!(Texts::reshape(vec!["x".to_string()], false), Texts::One("x".to_string()));
    assert_eq!(
        Texts::reshape(vec!["x".to_string()], true),
        Texts::Many(vec!["x".to_string()])
    );
    assert!(serde_json::from_str::<Texts>("42").is_err());
}
