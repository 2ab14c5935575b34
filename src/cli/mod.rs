//! CLI command implementations
//!
//! This module contains the business logic of each subcommand, kept out of
//! `main.rs` for testability.

// CLI glue code - relaxed lint requirements
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::needless_pass_by_value)]

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use crate::{
    api::{create_router, AppState},
    chat_template,
    config::ServeConfig,
    engine::{self, EngineHandle},
    error::{GatewayError, Result},
    http_client::{self, LoadTestConfig, LoadTestOutcome},
    prompt_cache::PromptFormatter,
    registry::{ModelRegistry, RegistryConfig},
    warmup::{ModelHealth, WarmupExecutor},
};

pub mod handlers;
pub use handlers::{Cli, Commands, ServeArgs};

/// Address probed to report outbound connectivity
pub const PROBE_ADDR: ([u8; 4], u16) = ([8, 8, 8, 8], 53);

/// Probe timeout
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Main CLI entrypoint - dispatches commands to handlers
pub async fn entrypoint(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => {
            let config = args.to_config()?;
            if !args.skip_probe {
                check_internet(SocketAddr::from(PROBE_ADDR), PROBE_TIMEOUT).await;
            }
            serve(config).await
        },
        Commands::Pull {
            model,
            revision,
            cache_dir,
            token,
            endpoint,
        } => {
            let config = RegistryConfig::default()
                .with_endpoint(endpoint)
                .with_token(token)
                .with_cache_dir(cache_dir);
            pull(config, &model, &revision).await
        },
        Commands::Bench {
            url,
            dataset,
            count,
            timeout,
            focus,
            flag,
        } => {
            let config = handlers::load_test_config(url, dataset, count, timeout, focus, flag);
            bench(config).await
        },
        Commands::Info => {
            print_info();
            Ok(())
        },
    }
}

/// Outbound TCP probe; logs CONNECTED or OFFLINE and never fails
pub async fn check_internet(addr: SocketAddr, timeout: Duration) -> bool {
    let connected = matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    );
    if connected {
        tracing::info!(%addr, "Network probe: CONNECTED");
    } else {
        tracing::warn!(%addr, "Network probe: OFFLINE");
    }
    connected
}

/// Load template, engine and warm-up; returns a ready state
///
/// This is the startup barrier: nothing is bound until it returns.
pub async fn prepare_state(config: &ServeConfig) -> Result<AppState> {
    config.validate()?;
    config.environment.apply();

    let model_path = config.engine.model_path.clone();
    let template = chat_template::load_model_template(&model_path)?;
    let formatter = Arc::new(PromptFormatter::new(template, config.cache_capacity));
    let sampling = config.sampling.clone().with_model_eos(&model_path);

    let engine_config = config.engine.clone();
    let engine = tokio::task::spawn_blocking(move || engine::load_engine(&engine_config))
        .await
        .map_err(|e| GatewayError::InferenceError(format!("Engine initialization panicked: {e}")))??;
    let handle = EngineHandle::new(engine, sampling);
    tracing::info!(
        engine = handle.engine_name(),
        serialized = handle.is_serialized(),
        stop_token_ids = ?handle.sampling().stop_token_ids,
        "Engine ready"
    );

    let health = ModelHealth::new();
    WarmupExecutor::new(config.warmup.clone())
        .warm_up(&formatter, &handle, &health)
        .await?;

    Ok(AppState::new(formatter, handle, health))
}

/// Warm up and serve until Ctrl+C
pub async fn serve(config: ServeConfig) -> Result<()> {
    let addr = config.socket_addr()?;
    let state = prepare_state(&config).await?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::IoError {
            message: format!("Failed to bind {addr}: {e}"),
        })?;
    tracing::info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::IoError {
            message: format!("Server error: {e}"),
        })?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

/// Download a model snapshot
pub async fn pull(config: RegistryConfig, model: &str, revision: &str) -> Result<()> {
    if config.token.is_none() {
        tracing::warn!("No hub token configured; private models will fail");
    }
    let registry = ModelRegistry::new(config)?;
    let summary = registry.pull(model, revision).await?;

    println!("Model: {model} ({revision})");
    println!("  Location: {}", summary.model_dir.display());
    println!(
        "  Downloaded: {} files ({})",
        summary.downloaded,
        format_size(summary.bytes)
    );
    println!("  Already present: {} files", summary.skipped);
    Ok(())
}

/// Run the load test and print the report
pub async fn bench(config: LoadTestConfig) -> Result<()> {
    println!(
        "Sending {} prompts from {} to {}",
        config.count,
        config.dataset.display(),
        config.url
    );

    let outcome = tokio::task::spawn_blocking(move || http_client::run_load_test(&config))
        .await
        .map_err(|e| GatewayError::InferenceError(format!("Load test panicked: {e}")))??;

    match outcome {
        LoadTestOutcome::Completed(report) => print!("{}", report.render()),
        LoadTestOutcome::Rejected { status, body } => {
            println!("Request failed with status {status}");
            println!("Body: {body}");
        },
    }
    Ok(())
}

fn print_info() {
    let defaults = ServeConfig::default();
    println!("infergate v{}", crate::VERSION);
    println!("Batch inference gateway");
    println!();
    println!("Endpoints:");
    println!("  GET  /         - Liveness ({{\"status\": \"batch\"}})");
    println!("  GET  /health   - Readiness report");
    println!("  POST /predict  - {{\"prompt\": str | [str]}} -> {{\"response\": str | [str]}}");
    println!();
    println!("Defaults:");
    println!("  Bind:           {}:{}", defaults.host, defaults.port);
    println!("  Model:          {}", defaults.engine.model_path.display());
    println!("  Engine:         {}", defaults.engine.endpoint);
    println!("  Max model len:  {}", defaults.engine.max_model_len);
    println!("  Max tokens:     {}", defaults.sampling.max_tokens);
    println!("  Prompt cache:   {} entries", defaults.cache_capacity);
    println!("  Warm-up data:   {}", defaults.warmup.dataset_path.display());
}

/// Format file size in human-readable form
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::EngineBackend, warmup::WarmupConfig};

    fn demo_config(dir: &tempfile::TempDir) -> ServeConfig {
        let dataset = dir.path().join("train.json");
        std::fs::write(&dataset, r#"[{"instruction": "2+2=", "output": "4"}]"#).expect("write");
        let model_dir = dir.path().join("Qwen3-0.6B");
        std::fs::create_dir_all(&model_dir).expect("mkdir");
        std::fs::write(model_dir.join("generation_config.json"), r#"{"eos_token_id": [151645, 151643]}"#)
            .expect("write");

        let mut config = ServeConfig::default()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_warmup(WarmupConfig::new().with_dataset_path(dataset));
        config.engine = config
            .engine
            .with_backend(EngineBackend::Demo)
            .with_model_path(model_dir);
        config
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[tokio::test]
    async fn test_check_internet_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        assert!(check_internet(addr, Duration::from_secs(1)).await);
        drop(listener);
    }

    #[tokio::test]
    async fn test_check_internet_closed_port_is_offline() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 9));
        assert!(!check_internet(addr, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_prepare_state_demo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = prepare_state(&demo_config(&dir)).await.expect("state");

        assert!(state.health().is_ready());
        assert_eq!(state.engine().engine_name(), "demo");
        assert_eq!(state.engine().sampling().stop_token_ids, vec![151645, 151643]);
        // Warm-up populated the prompt cache
        assert_eq!(state.formatter().stats().entries, 1);
        // Qwen3 fallback template disables thinking
        let prompt = state.formatter().format("2+2=").expect("format");
        assert!(prompt.ends_with("<think>\n\n</think>\n\n"));
    }

    #[tokio::test]
    async fn test_prepare_state_missing_dataset_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = demo_config(&dir);
        config.warmup.dataset_path = dir.path().join("missing.json");
        assert!(matches!(
            prepare_state(&config).await,
            Err(GatewayError::IoError { .. })
        ));
    }

    #[tokio::test]
    async fn test_prepare_state_rejects_invalid_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = demo_config(&dir).with_cache_capacity(0);
        assert!(prepare_state(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_bench_missing_dataset_is_reported() {
        let config = LoadTestConfig {
            dataset: "/nonexistent/train_base.json".into(),
            ..LoadTestConfig::default()
        };
        assert!(bench(config).await.is_err());
    }
}
