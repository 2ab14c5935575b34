//! Service configuration
//!
//! [`ServeConfig`] gathers everything `serve` needs. It can be read from a
//! JSON file; command-line flags then override individual fields.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::{EngineConfig, SamplingConfig},
    error::{GatewayError, Result},
    prompt_cache::DEFAULT_CACHE_CAPACITY,
    warmup::WarmupConfig,
};

/// Process environment exported before the engine starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Forbid the model libraries from reaching the network
    pub offline: bool,
    /// `TORCH_CUDA_ARCH_LIST` value
    pub cuda_arch_list: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            offline: true,
            cuda_arch_list: Some("12.0".to_string()),
        }
    }
}

impl EnvironmentConfig {
    /// Variables this configuration exports
    #[must_use]
    pub fn exported_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if self.offline {
            vars.push(("TRANSFORMERS_OFFLINE", "1".to_string()));
            vars.push(("HF_HUB_OFFLINE", "1".to_string()));
        }
        if let Some(arch) = &self.cuda_arch_list {
            vars.push(("TORCH_CUDA_ARCH_LIST", arch.clone()));
        }
        vars
    }

    /// Export the variables into this process
    ///
    /// Call before spawning threads that read the environment.
    pub fn apply(&self) {
        for (key, value) in self.exported_vars() {
            tracing::debug!(key, value = %value, "Exporting environment variable");
            std::env::set_var(key, value);
        }
    }
}

/// Configuration of the `serve` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Prompt cache capacity
    pub cache_capacity: usize,
    /// Engine configuration
    pub engine: EngineConfig,
    /// Sampling applied to every request
    pub sampling: SamplingConfig,
    /// Warm-up configuration
    pub warmup: WarmupConfig,
    /// Exported environment
    pub environment: EnvironmentConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            engine: EngineConfig::default(),
            sampling: SamplingConfig::default(),
            warmup: WarmupConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

impl ServeConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// `IoError` if unreadable, `InvalidConfiguration` if not valid JSON
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| GatewayError::IoError {
            message: format!("Failed to read config {}: {e}", path.display()),
        })?;
        serde_json::from_str(&json).map_err(|e| {
            GatewayError::InvalidConfiguration(format!("Invalid config {}: {e}", path.display()))
        })
    }

    /// Set bind host
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set bind port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set prompt cache capacity
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the engine configuration
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set the warm-up configuration
    #[must_use]
    pub fn with_warmup(mut self, warmup: WarmupConfig) -> Self {
        self.warmup = warmup;
        self
    }

    /// Check the whole configuration
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` describing the first problem found
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.cache_capacity == 0 {
            return Err(GatewayError::InvalidConfiguration(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.sampling.max_tokens == 0 {
            return Err(GatewayError::InvalidConfiguration(
                "sampling.max_tokens must be at least 1".to_string(),
            ));
        }
        if self.sampling.max_tokens > self.engine.max_model_len {
            return Err(GatewayError::InvalidConfiguration(format!(
                "sampling.max_tokens ({}) exceeds engine.max_model_len ({})",
                self.sampling.max_tokens, self.engine.max_model_len
            )));
        }
        self.engine.validate()
    }

    /// Address to bind
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` if `host` is not an IP address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.host.parse().map_err(|e| {
            GatewayError::InvalidConfiguration(format!("Invalid host '{}': {e}", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServeConfig::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.cache_capacity, 10_000);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.socket_addr().expect("addr").to_string(),
            "0.0.0.0:8000"
        );
    }

    #[test]
    fn test_environment_vars() {
        let vars = EnvironmentConfig::default().exported_vars();
        assert!(vars.contains(&("TRANSFORMERS_OFFLINE", "1".to_string())));
        assert!(vars.contains(&("HF_HUB_OFFLINE", "1".to_string())));
        assert!(vars.contains(&("TORCH_CUDA_ARCH_LIST", "12.0".to_string())));

        let online = EnvironmentConfig {
            offline: false,
            cuda_arch_list: None,
        };
        assert!(online.exported_vars().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ServeConfig::new().with_host("not-an-ip").validate().is_err());
        assert!(ServeConfig::new().with_cache_capacity(0).validate().is_err());

        let mut config = ServeConfig::new();
        config.sampling.max_tokens = 4096;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_partial() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("serve.json");
        fs::write(
            &path,
            r#"{"port": 9000, "engine": {"backend": "demo"}, "warmup": {"repeat": 1}}"#,
        )
        .expect("write");

        let config = ServeConfig::from_json_file(&path).expect("load");
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.warmup.repeat, 1);
        assert_eq!(config.sampling.max_tokens, 256);
    }

    #[test]
    fn test_from_json_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            ServeConfig::from_json_file(&dir.path().join("none.json")),
            Err(GatewayError::IoError { .. })
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{").expect("write");
        assert!(matches!(
            ServeConfig::from_json_file(&path),
            Err(GatewayError::InvalidConfiguration(_))
        ));
    }
}
