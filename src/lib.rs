//! # infergate
//!
//! Thin HTTP front-end for batched text generation. An external inference
//! engine owns the model weights, batching and memory; infergate wraps each
//! user message in the model's chat template, sends the whole request as one
//! batch and returns the completions in request order.
//!
//! ## Lifecycle
//!
//! 1. Load the chat template from the local model directory
//! 2. Initialize the engine (once, blocking)
//! 3. Warm up with the evaluation dataset
//! 4. Bind and serve `/predict`
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use infergate::{
//!     chat_template::ChatMLTemplate,
//!     engine::{DemoEngine, EngineHandle, SamplingConfig},
//!     prompt_cache::PromptFormatter,
//! };
//!
//! let formatter = PromptFormatter::new(Box::new(ChatMLTemplate::without_thinking()), 128);
//! let engine = EngineHandle::new(Arc::new(DemoEngine::new()), SamplingConfig::default());
//!
//! let prompts = formatter.format_all(&["2+2=".to_string()]).unwrap();
//! let completions = engine.generate_blocking(&prompts).unwrap();
//! assert_eq!(completions, vec!["2+2="]);
//! ```

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f64 for rates is acceptable
#![allow(clippy::cast_possible_truncation)] // u128 -> u64 for elapsed millis
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::single_match_else)] // Sometimes clearer than if-let
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections

/// HTTP API (`/`, `/health`, `/predict`)
#[cfg(feature = "server")]
pub mod api;
/// Chat template rendering (Jinja2 from the model directory, ChatML fallback)
pub mod chat_template;
/// CLI command implementations (extracted for testability)
#[cfg(feature = "server")]
pub mod cli;
pub mod config;
pub mod dataset;
/// Inference engine adapter
///
/// The engine is initialized once and shared by every request.
/// - `remote`: OpenAI-compatible completion server (vLLM)
/// - `managed`: vLLM server started by the gateway
/// - `demo`: deterministic in-process echo engine
pub mod engine;
pub mod error;
/// HTTP client for load-testing a running gateway
pub mod http_client;
pub mod prompt_cache;
/// Model snapshot download from a ModelScope-compatible hub
pub mod registry;
pub mod warmup;

// Re-exports for convenience
pub use error::{GatewayError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
