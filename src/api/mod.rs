//! HTTP API for batch inference
//!
//! ## Endpoints
//!
//! - `GET /` - Liveness, returns `{"status": "batch"}`
//! - `GET /health` - Readiness report and request counters
//! - `POST /predict` - Format and generate for one prompt or a list of prompts
//!
//! The response shape mirrors the request: a string prompt yields a string
//! response, a list of prompts yields a list of responses in the same order.
//!
//! ## Example
//!
//! ```rust,ignore
//! use infergate::api::{create_router, AppState};
//!
//! let state = AppState::new(formatter, engine, health);
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    chat_template::ChatMLTemplate,
    engine::{DemoEngine, EngineHandle, SamplingConfig},
    error::GatewayError,
    prompt_cache::{PromptFormatter, DEFAULT_CACHE_CAPACITY},
    warmup::{HealthReport, ModelHealth},
};

/// Application state shared across handlers
#[derive(Clone, Debug)]
pub struct AppState {
    formatter: Arc<PromptFormatter>,
    engine: EngineHandle,
    health: ModelHealth,
}

impl AppState {
    /// Create state from warmed-up components
    #[must_use]
    pub fn new(formatter: Arc<PromptFormatter>, engine: EngineHandle, health: ModelHealth) -> Self {
        Self {
            formatter,
            engine,
            health,
        }
    }

    /// Ready state backed by the in-process demo engine
    #[must_use]
    pub fn demo() -> Self {
        let formatter = PromptFormatter::new(
            Box::new(ChatMLTemplate::without_thinking()),
            DEFAULT_CACHE_CAPACITY,
        );
        let engine = EngineHandle::new(Arc::new(DemoEngine::new()), SamplingConfig::default());
        Self::new(Arc::new(formatter), engine, ModelHealth::ready())
    }

    /// Prompt formatter
    #[must_use]
    pub fn formatter(&self) -> &PromptFormatter {
        &self.formatter
    }

    /// Engine handle
    #[must_use]
    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Health tracker
    #[must_use]
    pub fn health(&self) -> &ModelHealth {
        &self.health
    }
}

// ============================================================================
// Request / response types
// ============================================================================

/// A single text or an ordered list of texts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Texts {
    /// One text
    One(String),
    /// Ordered batch
    Many(Vec<String>),
}

impl Texts {
    /// Whether this is the list form
    #[must_use]
    pub fn is_batch(&self) -> bool {
        matches!(self, Self::Many(_))
    }

    /// Number of texts
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(items) => items.len(),
        }
    }

    /// True for an empty list
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalize to a sequence
    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(text) => vec![text],
            Self::Many(items) => items,
        }
    }

    /// Rebuild the shape of a request from its results
    #[must_use]
    pub fn reshape(items: Vec<String>, batch: bool) -> Self {
        if batch {
            Self::Many(items)
        } else {
            Self::One(items.into_iter().next().unwrap_or_default())
        }
    }
}

/// Prediction request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Raw user message or list of messages
    pub prompt: Texts,
}

/// Prediction response, positionally aligned with the request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Completion or list of completions
    pub response: Texts,
}

/// Liveness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Service mode
    pub status: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

type ApiErr = (StatusCode, Json<ErrorResponse>);

fn api_err(status: StatusCode, msg: impl std::fmt::Display) -> ApiErr {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
}

fn gateway_err(err: &GatewayError) -> ApiErr {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    api_err(status, err)
}

// ============================================================================
// Router and handlers
// ============================================================================

/// Create the service router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/health", get(health_handler))
        .route("/predict", post(predict_handler))
        .with_state(state)
}

fn require_ready(state: &AppState) -> Result<(), ApiErr> {
    if state.health.is_ready() {
        Ok(())
    } else {
        Err(api_err(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is still warming up",
        ))
    }
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiErr> {
    require_ready(&state)?;
    Ok(Json(StatusResponse {
        status: "batch".to_string(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.report())
}

/// Format every prompt, run one batched engine call, answer in request shape
async fn predict_handler(
    State(state): State<AppState>,
    payload: Result<Json<PromptRequest>, JsonRejection>,
) -> Result<Json<PredictResponse>, ApiErr> {
    require_ready(&state)?;

    let Json(request) = payload.map_err(|rejection| {
        state.health.record_failure();
        tracing::warn!(status = %rejection.status(), "Rejected predict request");
        api_err(rejection.status(), rejection.body_text())
    })?;

    let batch = request.prompt.is_batch();
    let messages = request.prompt.into_vec();

    let completions = match run_batch(&state, &messages).await {
        Ok(completions) => completions,
        Err(e) => {
            state.health.record_failure();
            tracing::error!(error = %e, prompts = messages.len(), "Prediction failed");
            return Err(gateway_err(&e));
        },
    };

    tracing::info!(count = completions.len(), "Generated results");
    state.health.record_success();
    Ok(Json(PredictResponse {
        response: Texts::reshape(completions, batch),
    }))
}

async fn run_batch(state: &AppState, messages: &[String]) -> crate::error::Result<Vec<String>> {
    let prompts = state.formatter.format_all(messages)?;
    state.engine.generate(prompts).await
}

#[cfg(test)]
pub(crate) mod test_helpers;

#[cfg(test)]
mod tests;
