//! Shared fixtures for api tests

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use tower::util::ServiceExt;

use super::*;
use crate::{
    engine::{InferenceEngine, SamplingConfig},
    error::Result,
};

/// Create a test application with demo state
pub fn create_test_app() -> Router {
    create_router(AppState::demo())
}

/// Ready state around an arbitrary engine
pub fn state_with_engine(engine: Arc<dyn InferenceEngine>) -> AppState {
    let formatter = PromptFormatter::new(Box::new(ChatMLTemplate::without_thinking()), 64);
    AppState::new(
        Arc::new(formatter),
        EngineHandle::new(engine, SamplingConfig::default()),
        ModelHealth::ready(),
    )
}

/// Fails the first `failures` calls with an out-of-memory error
pub struct FlakyEngine {
    failures: usize,
    calls: AtomicUsize,
}

impl FlakyEngine {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for FlakyEngine {
    fn name(&self) -> &str {
        "flaky"
    }

    fn generate(&self, prompts: &[String], _sampling: &SamplingConfig) -> Result<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(GatewayError::InferenceError(
                "CUDA out of memory. Tried to allocate 2.00 GiB".to_string(),
            ));
        }
        Ok(prompts.iter().map(|p| format!("ok:{}", p.len())).collect())
    }
}

/// POST a raw JSON body to `/predict`
pub async fn post_predict(app: &Router, body: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/predict")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("test"),
        )
        .await
        .expect("test");
    read_json(response).await
}

/// GET `uri`
pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("test"))
        .await
        .expect("test");
    read_json(response).await
}

async fn read_json(response: axum::response::Response) -> (StatusCode, serde_json::Value) {
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("test");
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}
