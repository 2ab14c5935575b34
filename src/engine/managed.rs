//! vLLM server launched by the gateway
//!
//! The engine knobs of [`EngineConfig`] become `vllm serve` flags. The child
//! process listens on the configured endpoint; once it lists the served
//! model, calls go through [`OpenAiCompletionsEngine`]. The child is killed
//! when the engine is dropped.

use std::{
    process::{Child, Command, Stdio},
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use super::{EngineConfig, InferenceEngine, OpenAiCompletionsEngine, SamplingConfig};
use crate::error::{GatewayError, Result};

/// Delay between readiness checks while the server loads
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Command-line arguments for `<launcher> serve`
///
/// # Errors
///
/// `InvalidConfiguration` when the endpoint is not a URL with a host
pub fn launch_args(config: &EngineConfig) -> Result<Vec<String>> {
    let url = reqwest::Url::parse(&config.endpoint).map_err(|e| {
        GatewayError::InvalidConfiguration(format!("Invalid engine endpoint '{}': {e}", config.endpoint))
    })?;
    let host = url.host_str().ok_or_else(|| {
        GatewayError::InvalidConfiguration(format!("Engine endpoint '{}' has no host", config.endpoint))
    })?;
    let port = url.port_or_known_default().unwrap_or(8000);

    let mut args = vec![
        "serve".to_string(),
        config.model_path.display().to_string(),
        "--served-model-name".to_string(),
        config.served_model_name(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
        "--dtype".to_string(),
        config.dtype.clone(),
    ];
    if let Some(quantization) = &config.quantization {
        args.extend(["--quantization".to_string(), quantization.clone()]);
    }
    args.extend([
        "--tensor-parallel-size".to_string(),
        config.tensor_parallel_size.to_string(),
        "--gpu-memory-utilization".to_string(),
        config.gpu_memory_utilization.to_string(),
        "--max-model-len".to_string(),
        config.max_model_len.to_string(),
        "--max-num-seqs".to_string(),
        config.max_num_seqs.to_string(),
    ]);
    args.push(if config.enable_prefix_caching {
        "--enable-prefix-caching".to_string()
    } else {
        "--no-enable-prefix-caching".to_string()
    });
    if config.enforce_eager {
        args.push("--enforce-eager".to_string());
    }
    if config.trust_remote_code {
        args.push("--trust-remote-code".to_string());
    }
    Ok(args)
}

/// Completion server owned by this process
#[derive(Debug)]
pub struct ManagedEngine {
    child: Mutex<Child>,
    client: OpenAiCompletionsEngine,
}

impl ManagedEngine {
    /// Start the server and block until it serves the model
    ///
    /// # Errors
    ///
    /// `InferenceError` if the launcher cannot be started, exits early or is
    /// not ready within `startup_timeout_secs`; `ModelNotFound` or
    /// `InvalidConfiguration` if the started server disagrees with `config`
    pub fn launch(config: &EngineConfig) -> Result<Self> {
        let args = launch_args(config)?;
        tracing::info!(launcher = %config.launcher, ?args, "Launching engine server");

        let mut child = Command::new(&config.launcher)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| {
                GatewayError::InferenceError(format!("Failed to launch '{}': {e}", config.launcher))
            })?;

        let deadline = Instant::now() + Duration::from_secs(config.startup_timeout_secs);
        loop {
            match OpenAiCompletionsEngine::connect(config) {
                Ok(client) => {
                    tracing::info!(model = client.model(), pid = child.id(), "Engine server ready");
                    return Ok(Self {
                        child: Mutex::new(child),
                        client,
                    });
                },
                Err(GatewayError::ConnectionError(reason)) => {
                    let exited = child.try_wait().map_err(|e| {
                        GatewayError::InferenceError(format!("Failed to poll engine server: {e}"))
                    })?;
                    if let Some(status) = exited {
                        return Err(GatewayError::InferenceError(format!(
                            "Engine server exited during startup ({status})"
                        )));
                    }
                    if Instant::now() >= deadline {
                        stop(&mut child);
                        return Err(GatewayError::InferenceError(format!(
                            "Engine server not ready after {}s: {reason}",
                            config.startup_timeout_secs
                        )));
                    }
                    tracing::debug!(%reason, "Waiting for engine server");
                    thread::sleep(POLL_INTERVAL);
                },
                Err(e) => {
                    stop(&mut child);
                    return Err(e);
                },
            }
        }
    }
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::warn!(error = %e, "Failed to stop engine server");
    }
    let _ = child.wait();
}

impl Drop for ManagedEngine {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        tracing::info!(pid = child.id(), "Stopping engine server");
        stop(child);
    }
}

impl InferenceEngine for ManagedEngine {
    fn name(&self) -> &str {
        "vllm-managed"
    }

    fn generate(&self, prompts: &[String], sampling: &SamplingConfig) -> Result<Vec<String>> {
        self.client.generate(prompts, sampling)
    }

    fn supports_concurrent_calls(&self) -> bool {
        self.client.supports_concurrent_calls()
    }
}
