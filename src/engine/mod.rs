//! Inference engine adapter
//!
//! The engine is an external collaborator that owns the model weights and
//! does its own batching. This module models it as a single capability,
//! [`InferenceEngine::generate`], and wraps it in an [`EngineHandle`] that
//! every request shares.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use infergate::engine::{DemoEngine, EngineHandle, SamplingConfig};
//!
//! let handle = EngineHandle::new(Arc::new(DemoEngine::new()), SamplingConfig::default());
//! let out = handle.generate_blocking(&["hello world".to_string()]).unwrap();
//! assert_eq!(out.len(), 1);
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{GatewayError, Result};

mod config;
mod demo;
mod managed;
mod openai;

pub use config::{read_eos_token_ids, EngineBackend, EngineConfig, SamplingConfig};
pub use demo::DemoEngine;
pub use managed::{launch_args, ManagedEngine};
pub use openai::OpenAiCompletionsEngine;

/// An engine that turns templated prompts into completions
///
/// `generate` is a blocking call. Implementations must return exactly one
/// completion per prompt, in input order.
pub trait InferenceEngine: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Generate one completion per prompt
    ///
    /// # Errors
    ///
    /// Any engine failure (resource exhaustion, malformed input, transport)
    fn generate(&self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>>;

    /// Whether `generate` may be invoked from several threads at once
    fn supports_concurrent_calls(&self) -> bool {
        false
    }
}

/// Initialize the engine selected by `config`
///
/// Blocking; call it from a blocking context before serving traffic.
///
/// # Errors
///
/// Returns the engine's initialization failure (unreachable server, model
/// not served, invalid configuration)
pub fn load_engine(config: &EngineConfig) -> Result<Arc<dyn InferenceEngine>> {
    config.validate()?;
    tracing::info!(
        backend = ?config.backend,
        model = %config.model_path.display(),
        dtype = %config.dtype,
        quantization = ?config.quantization,
        tensor_parallel_size = config.tensor_parallel_size,
        gpu_memory_utilization = config.gpu_memory_utilization,
        max_model_len = config.max_model_len,
        max_num_seqs = config.max_num_seqs,
        prefix_caching = config.enable_prefix_caching,
        "Initializing inference engine"
    );
    let engine: Arc<dyn InferenceEngine> = match config.backend {
        EngineBackend::Remote => Arc::new(OpenAiCompletionsEngine::connect(config)?),
        EngineBackend::Managed => Arc::new(ManagedEngine::launch(config)?),
        EngineBackend::Demo => Arc::new(DemoEngine::new()),
    };
    Ok(engine)
}

/// Process-wide handle to the loaded engine and its sampling configuration
///
/// Cloning is cheap; all clones share the same engine. Engines that do not
/// declare concurrent-call safety are serialized behind a mutex.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn InferenceEngine>,
    sampling: Arc<SamplingConfig>,
    serial: Option<Arc<Mutex<()>>>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine.name())
            .field("sampling", &self.sampling)
            .field("serialized", &self.serial.is_some())
            .finish()
    }
}

impl EngineHandle {
    /// Wrap an initialized engine
    #[must_use]
    pub fn new(engine: Arc<dyn InferenceEngine>, sampling: SamplingConfig) -> Self {
        let serial = if engine.supports_concurrent_calls() {
            None
        } else {
            Some(Arc::new(Mutex::new(())))
        };
        Self {
            engine,
            sampling: Arc::new(sampling),
            serial,
        }
    }

    /// Sampling configuration applied to every call
    #[must_use]
    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Engine name
    #[must_use]
    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Whether calls are serialized by this handle
    #[must_use]
    pub fn is_serialized(&self) -> bool {
        self.serial.is_some()
    }

    /// Generate completions, blocking the current thread
    ///
    /// An empty batch returns immediately without invoking the engine.
    ///
    /// # Errors
    ///
    /// Engine failures, or `InferenceError` when the engine returns a
    /// different number of completions than prompts
    pub fn generate_blocking(&self, prompts: &[String]) -> Result<Vec<String>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self
            .serial
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));

        let completions = self.engine.generate(prompts, &self.sampling)?;
        if completions.len() != prompts.len() {
            return Err(GatewayError::InferenceError(format!(
                "Engine returned {} completions for {} prompts",
                completions.len(),
                prompts.len()
            )));
        }
        Ok(completions)
    }

    /// Generate completions on the blocking thread pool
    ///
    /// # Errors
    ///
    /// Same as [`Self::generate_blocking`]; a panic inside the engine is
    /// reported as `InferenceError`
    pub async fn generate(&self, prompts: Vec<String>) -> Result<Vec<String>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }
        let handle = self.clone();
        tokio::task::spawn_blocking(move || handle.generate_blocking(&prompts))
            .await
            .map_err(|e| GatewayError::InferenceError(format!("Engine task failed: {e}")))?
    }
}
