//! Remote engine against a local completion-server stub
//!
//! The engine client is blocking, so each test owns its runtime and only
//! enters it to run the stub and drive the router.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use infergate::{
    api::{create_router, AppState},
    chat_template::ChatMLTemplate,
    engine::{EngineConfig, EngineHandle, OpenAiCompletionsEngine, SamplingConfig},
    prompt_cache::PromptFormatter,
    warmup::ModelHealth,
    GatewayError,
};
use tokio::runtime::Runtime;
use tower::util::ServiceExt;

/// How the stub answers `/v1/completions`
#[derive(Clone, Copy)]
enum Reply {
    /// Echo each prompt's length, choices in reverse order
    Lengths,
    /// Plain text instead of JSON
    Garbage,
}

async fn models() -> impl IntoResponse {
    Json(serde_json::json!({
        "object": "list",
        "data": [{"id": "m", "object": "model", "max_model_len": 2048}]
    }))
}

async fn completions(
    State(reply): State<Reply>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    match reply {
        Reply::Garbage => "upstream exploded".into_response(),
        Reply::Lengths => {
            let prompts = body["prompt"].as_array().cloned().unwrap_or_default();
            let choices: Vec<_> = prompts
                .iter()
                .enumerate()
                .rev()
                .map(|(index, p)| {
                    let len = p.as_str().map_or(0, str::len);
                    serde_json::json!({"index": index, "text": len.to_string()})
                })
                .collect();
            Json(serde_json::json!({"choices": choices})).into_response()
        },
    }
}

fn spawn_engine_stub(rt: &Runtime, reply: Reply) -> SocketAddr {
    let app = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/completions", post(completions))
        .with_state(reply);
    let listener = rt
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    rt.spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

fn engine_config(addr: SocketAddr) -> EngineConfig {
    EngineConfig::default()
        .with_endpoint(format!("http://{addr}"))
        .with_served_model_name("m")
}

fn state_for(engine: OpenAiCompletionsEngine) -> AppState {
    let formatter = PromptFormatter::new(Box::new(ChatMLTemplate::without_thinking()), 64);
    AppState::new(
        Arc::new(formatter),
        EngineHandle::new(Arc::new(engine), SamplingConfig::default()),
        ModelHealth::ready(),
    )
}

fn post_predict(rt: &Runtime, state: &AppState, body: &str) -> (StatusCode, serde_json::Value) {
    let app = create_router(state.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");
    rt.block_on(async {
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json"))
    })
}

#[test]
fn test_unreadable_engine_reply_is_server_error() {
    let rt = Runtime::new().expect("runtime");
    let addr = spawn_engine_stub(&rt, Reply::Garbage);
    let engine = OpenAiCompletionsEngine::connect(&engine_config(addr)).expect("connect");
    let state = state_for(engine);

    let (status, body) = post_predict(&rt, &state, r#"{"prompt": "2+2="}"#);

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error = body["error"].as_str().expect("error message");
    assert!(error.contains("Failed to parse completion response"), "{error}");
    assert_eq!(state.health().failed_requests(), 1);
    assert!(state.health().is_ready());
}

#[test]
fn test_remote_choices_are_realigned() {
    let rt = Runtime::new().expect("runtime");
    let addr = spawn_engine_stub(&rt, Reply::Lengths);
    let engine = OpenAiCompletionsEngine::connect(&engine_config(addr)).expect("connect");
    assert_eq!(engine.model(), "m");
    let state = state_for(engine);

    let (status, body) = post_predict(&rt, &state, r#"{"prompt": ["a", "bbbb"]}"#);

    assert_eq!(status, StatusCode::OK);
    let response: Vec<usize> = body["response"]
        .as_array()
        .expect("list")
        .iter()
        .map(|v| v.as_str().and_then(|s| s.parse().ok()).expect("length"))
        .collect();
    assert_eq!(response.len(), 2);
    // Same template around both, so the longer message yields the longer prompt
    assert_eq!(response[1] - response[0], 3);
}

#[test]
fn test_connect_checks_served_model() {
    let rt = Runtime::new().expect("runtime");
    let addr = spawn_engine_stub(&rt, Reply::Lengths);

    let missing = engine_config(addr).with_served_model_name("other");
    assert!(matches!(
        OpenAiCompletionsEngine::connect(&missing),
        Err(GatewayError::ModelNotFound(_))
    ));

    let too_long = engine_config(addr).with_max_model_len(4096);
    assert!(matches!(
        OpenAiCompletionsEngine::connect(&too_long),
        Err(GatewayError::InvalidConfiguration(_))
    ));
}
