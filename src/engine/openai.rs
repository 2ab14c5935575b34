//! OpenAI-compatible completion engine (vLLM, llama.cpp server)
//!
//! The engine server owns the weights, KV cache and batching. One
//! `generate` call becomes one `/v1/completions` request carrying every
//! prompt; choices are realigned by their `index` field.

use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{EngineConfig, InferenceEngine, SamplingConfig};
use crate::error::{GatewayError, Result};

/// Batched completion request
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a [String],
    max_tokens: usize,
    temperature: f32,
    /// vLLM extension; -1 disables
    top_k: i64,
    stop: &'a [String],
    /// vLLM extension
    #[serde(skip_serializing_if = "no_ids")]
    stop_token_ids: &'a [u32],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    n: usize,
    stream: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn no_ids(ids: &&[u32]) -> bool {
    ids.is_empty()
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    index: usize,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelCard>,
}

#[derive(Debug, Deserialize)]
struct ModelCard {
    id: String,
    #[serde(default)]
    max_model_len: Option<usize>,
}

/// Engine backed by a remote OpenAI-compatible completion server
#[derive(Debug)]
pub struct OpenAiCompletionsEngine {
    client: Client,
    base_url: String,
    model: String,
}

impl OpenAiCompletionsEngine {
    /// Connect to the engine server and verify it serves the configured model
    ///
    /// Blocking. Fails when the server is unreachable, does not list the
    /// model, or reports a context length below `max_model_len`.
    ///
    /// # Errors
    ///
    /// `ConnectionError`, `ModelNotFound` or `InvalidConfiguration`
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout_secs.map(Duration::from_secs))
            .build()
            .map_err(|e| GatewayError::ConnectionError(format!("Failed to create HTTP client: {e}")))?;

        let engine = Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.served_model_name(),
        };

        let card = engine.find_model()?;
        if let Some(served_len) = card.max_model_len {
            if served_len < config.max_model_len {
                return Err(GatewayError::InvalidConfiguration(format!(
                    "Engine serves '{}' with max_model_len {served_len}, configured {}",
                    card.id, config.max_model_len
                )));
            }
        }
        tracing::info!(endpoint = %engine.base_url, model = %engine.model, "Connected to inference engine");
        Ok(engine)
    }

    /// Served model name
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn find_model(&self) -> Result<ModelCard> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| GatewayError::ConnectionError(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::ConnectionError(format!(
                "HTTP {status} from {url}: {body}"
            )));
        }

        let list: ModelList = response.json().map_err(|e| {
            GatewayError::ConnectionError(format!("Invalid model list from {url}: {e}"))
        })?;

        list.data
            .into_iter()
            .find(|card| card.id == self.model)
            .ok_or_else(|| GatewayError::ModelNotFound(self.model.clone()))
    }
}

impl InferenceEngine for OpenAiCompletionsEngine {
    fn name(&self) -> &str {
        "openai-completions"
    }

    fn generate(&self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>> {
        let url = format!("{}/v1/completions", self.base_url);
        let request = CompletionRequest {
            model: &self.model,
            prompt: prompts,
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_k: if sampling.top_k == 0 {
                -1
            } else {
                i64::try_from(sampling.top_k).unwrap_or(i64::MAX)
            },
            stop: &sampling.stop,
            stop_token_ids: &sampling.stop_token_ids,
            seed: sampling.seed,
            n: 1,
            stream: false,
        };

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|e| GatewayError::ConnectionError(format!("HTTP request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(GatewayError::InferenceError(format!(
                "HTTP {status} from {url}: {body}"
            )));
        }

        // A reply the gateway cannot read is the engine's fault, never the caller's
        let completion: CompletionResponse = response.json().map_err(|e| {
            GatewayError::InferenceError(format!("Failed to parse completion response: {e}"))
        })?;

        tracing::debug!(
            prompts = prompts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Engine batch complete"
        );
        align_choices(completion.choices, prompts.len())
    }

    fn supports_concurrent_calls(&self) -> bool {
        true
    }
}

/// Place each choice at its `index`; every slot must be filled exactly once
fn align_choices(choices: Vec<CompletionChoice>, expected: usize) -> Result<Vec<String>> {
    let mut slots: Vec<Option<String>> = vec![None; expected];
    for choice in choices {
        let slot = slots.get_mut(choice.index).ok_or_else(|| {
            GatewayError::InferenceError(format!(
                "Choice index {} out of range for {expected} prompts",
                choice.index
            ))
        })?;
        if slot.replace(choice.text).is_some() {
            return Err(GatewayError::InferenceError(format!(
                "Duplicate choice index {}",
                choice.index
            )));
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(i, slot)| {
            slot.ok_or_else(|| GatewayError::InferenceError(format!("Missing choice for prompt {i}")))
        })
        .collect()
}
