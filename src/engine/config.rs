//! Engine and sampling configuration
//!
//! Both are fixed at startup and shared by every request. The engine
//! configuration mirrors the knobs of a vLLM-style engine; the sampling
//! configuration is applied identically to every generation call.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Which engine implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// OpenAI-compatible completion server that owns the model weights,
    /// started and configured outside the gateway
    #[default]
    Remote,
    /// vLLM server launched by the gateway with this configuration
    Managed,
    /// Deterministic in-process echo engine (smoke runs, tests)
    Demo,
}

/// Static engine configuration, loaded once at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine implementation
    pub backend: EngineBackend,
    /// Local model directory (weights, tokenizer config)
    pub model_path: PathBuf,
    /// Name the engine serves the model under (defaults to `model_path`)
    pub served_model_name: Option<String>,
    /// Base URL of the engine server (remote backend)
    pub endpoint: String,
    /// Per-call timeout in seconds; `None` waits for the engine indefinitely
    pub request_timeout_secs: Option<u64>,
    /// Program started by the managed backend
    pub launcher: String,
    /// How long the managed backend waits for the server to list the model
    pub startup_timeout_secs: u64,
    /// Weight precision
    pub dtype: String,
    /// Weight quantization scheme
    pub quantization: Option<String>,
    /// Tensor parallel degree
    pub tensor_parallel_size: usize,
    /// Fraction of GPU memory the engine may claim
    pub gpu_memory_utilization: f32,
    /// Disable graph capture
    pub enforce_eager: bool,
    /// Maximum sequence length (prompt + completion)
    pub max_model_len: usize,
    /// Maximum concurrent sequences inside the engine
    pub max_num_seqs: usize,
    /// Share KV blocks across prompts with a common prefix
    pub enable_prefix_caching: bool,
    /// Allow model-provided code when loading
    pub trust_remote_code: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: EngineBackend::Remote,
            model_path: PathBuf::from("./local-model/hurrylu/Qwen3-0.6B-ADDR64V1"),
            served_model_name: None,
            endpoint: "http://127.0.0.1:8001".to_string(),
            request_timeout_secs: None,
            launcher: "vllm".to_string(),
            startup_timeout_secs: 900,
            dtype: "bfloat16".to_string(),
            quantization: Some("fp8".to_string()),
            tensor_parallel_size: 1,
            gpu_memory_utilization: 0.95,
            enforce_eager: false,
            max_model_len: 1024,
            max_num_seqs: 1024,
            enable_prefix_caching: true,
            trust_remote_code: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend
    #[must_use]
    pub fn with_backend(mut self, backend: EngineBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Set the local model directory
    #[must_use]
    pub fn with_model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = path.into();
        self
    }

    /// Set the engine server base URL
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Set the served model name
    #[must_use]
    pub fn with_served_model_name(mut self, name: impl Into<String>) -> Self {
        self.served_model_name = Some(name.into());
        self
    }

    /// Set the program the managed backend starts
    #[must_use]
    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Set the managed backend's startup timeout
    #[must_use]
    pub fn with_startup_timeout_secs(mut self, secs: u64) -> Self {
        self.startup_timeout_secs = secs;
        self
    }

    /// Set the maximum sequence length
    #[must_use]
    pub fn with_max_model_len(mut self, len: usize) -> Self {
        self.max_model_len = len;
        self
    }

    /// Name used when addressing the model on the engine
    #[must_use]
    pub fn served_model_name(&self) -> String {
        self.served_model_name
            .clone()
            .unwrap_or_else(|| self.model_path.display().to_string())
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for out-of-range values
    pub fn validate(&self) -> Result<()> {
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(GatewayError::InvalidConfiguration(format!(
                "gpu_memory_utilization must be in (0, 1], got {}",
                self.gpu_memory_utilization
            )));
        }
        if self.tensor_parallel_size == 0 {
            return Err(GatewayError::InvalidConfiguration(
                "tensor_parallel_size must be at least 1".to_string(),
            ));
        }
        if self.max_model_len == 0 || self.max_num_seqs == 0 {
            return Err(GatewayError::InvalidConfiguration(
                "max_model_len and max_num_seqs must be non-zero".to_string(),
            ));
        }
        if self.backend != EngineBackend::Demo && self.endpoint.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "remote backend requires an endpoint".to_string(),
            ));
        }
        if self.backend == EngineBackend::Managed && self.launcher.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "managed backend requires a launcher".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sampling parameters shared by every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sampling temperature (0.0 = greedy)
    pub temperature: f32,
    /// Top-k cutoff (0 disables)
    pub top_k: usize,
    /// Maximum tokens to generate per prompt
    pub max_tokens: usize,
    /// Stop sequences
    pub stop: Vec<String>,
    /// Stop token ids
    pub stop_token_ids: Vec<u32>,
    /// Seed for reproducible sampling
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            max_tokens: 256,
            stop: vec![
                "\n\n".to_string(),
                "<|endoftext|>".to_string(),
                "<|im_end|>".to_string(),
            ],
            stop_token_ids: Vec::new(),
            seed: Some(42),
        }
    }
}

impl SamplingConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.max(0.0);
        self
    }

    /// Set maximum generated tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens.max(1);
        self
    }

    /// Replace the stop sequences
    #[must_use]
    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    /// Add stop token ids, skipping duplicates
    #[must_use]
    pub fn with_stop_token_ids(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        for id in ids {
            if !self.stop_token_ids.contains(&id) {
                self.stop_token_ids.push(id);
            }
        }
        self
    }

    /// Add the model's EOS token ids found in `model_dir`
    #[must_use]
    pub fn with_model_eos(self, model_dir: &Path) -> Self {
        let ids = read_eos_token_ids(model_dir);
        if ids.is_empty() {
            tracing::debug!(dir = %model_dir.display(), "No eos_token_id found in model directory");
        }
        self.with_stop_token_ids(ids)
    }
}

/// Read `eos_token_id` from `generation_config.json`, falling back to `config.json`
///
/// The field may be a single integer or a list. Missing or unreadable files
/// yield an empty list.
#[must_use]
pub fn read_eos_token_ids(model_dir: &Path) -> Vec<u32> {
    for name in ["generation_config.json", "config.json"] {
        let Ok(text) = fs::read_to_string(model_dir.join(name)) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        let ids = eos_ids_from_value(value.get("eos_token_id"));
        if !ids.is_empty() {
            return ids;
        }
    }
    Vec::new()
}

fn eos_ids_from_value(value: Option<&serde_json::Value>) -> Vec<u32> {
    match value {
        Some(serde_json::Value::Number(n)) => n
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .into_iter()
            .collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(serde_json::Value::as_u64)
            .filter_map(|id| u32::try_from(id).ok())
            .collect(),
        _ => Vec::new(),
    }
}
