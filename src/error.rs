//! Error types for infergate
//!
//! One error enum for the whole crate. Startup code bubbles these up to
//! `main`; HTTP handlers map them onto status codes.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors produced while templating, generating, serving or downloading
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Chat template could not be compiled or rendered
    #[error("Template error: {reason}")]
    TemplateError {
        /// What went wrong
        reason: String,
    },

    /// The inference engine failed to produce completions
    #[error("Inference error: {0}")]
    InferenceError(String),

    /// A network peer (engine server, registry) was unreachable or misbehaved
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Input could not be parsed (JSON dataset, config file, engine reply)
    #[error("Format error: {reason}")]
    FormatError {
        /// What went wrong
        reason: String,
    },

    /// Filesystem failure
    #[error("I/O error: {message}")]
    IoError {
        /// What went wrong
        message: String,
    },

    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The requested model is not served / not present
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Model registry rejected a request
    #[error("Registry error: {0}")]
    RegistryError(String),
}

impl GatewayError {
    /// Whether this error is caused by the caller rather than the server
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::FormatError { .. })
    }
}
