//! Command-line definitions
//!
//! Kept apart from the command bodies so argument parsing can be tested
//! without starting anything.

use std::{path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    config::ServeConfig,
    engine::EngineBackend,
    error::Result,
    http_client::LoadTestConfig,
    registry::{DEFAULT_ENDPOINT, TOKEN_ENV},
};

/// Default model fetched by `pull`
pub const DEFAULT_MODEL_ID: &str = "hurrylu/Qwen3-0.6B-ADDR64V1";

/// infergate - batch inference gateway
#[derive(Parser, Debug)]
#[command(name = "infergate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Warm up the engine and serve `/predict`
    ///
    /// Examples:
    ///   infergate serve --model ./local-model/hurrylu/Qwen3-0.6B-ADDR64V1
    ///   infergate serve --demo --dataset ./train.json --port 8000
    Serve(ServeArgs),
    /// Download a model snapshot from the hub
    ///
    /// Examples:
    ///   infergate pull
    ///   infergate pull --model hurrylu/Qwen3-0.6B-ADDR64V1 --cache-dir ./local-model
    Pull {
        /// Model id on the hub
        #[arg(long, default_value = DEFAULT_MODEL_ID)]
        model: String,

        /// Revision to fetch
        #[arg(long, default_value = "master")]
        revision: String,

        /// Local model cache root
        #[arg(long, default_value = "./local-model")]
        cache_dir: PathBuf,

        /// Hub access token
        #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,

        /// Hub base URL
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },
    /// Send the dataset to a running server as one batch and compare answers
    Bench {
        /// `/predict` URL
        #[arg(long, default_value = "http://localhost:8000/predict")]
        url: String,

        /// Dataset file (JSON array of records)
        #[arg(long, default_value = "train_base.json")]
        dataset: PathBuf,

        /// Number of records to send
        #[arg(short = 'n', long, default_value = "100")]
        count: usize,

        /// Request timeout in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,

        /// Always show records whose reference contains this marker
        #[arg(long, default_value = "blockIdx")]
        focus: String,

        /// Warn when a focused answer contains this pattern
        #[arg(long, default_value = "blockDim.y")]
        flag: String,
    },
    /// Show version and defaults
    Info,
}

/// Options of `serve`; each one overrides the config file
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Local model directory
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// Name the engine serves the model under
    #[arg(long)]
    pub served_model_name: Option<String>,

    /// Engine server base URL
    #[arg(long)]
    pub engine_url: Option<String>,

    /// Engine backend
    #[arg(long, value_enum)]
    pub backend: Option<EngineBackend>,

    /// Program started by the managed backend
    #[arg(long)]
    pub launcher: Option<String>,

    /// Use the in-process demo engine
    #[arg(long)]
    pub demo: bool,

    /// Warm-up dataset
    #[arg(long)]
    pub dataset: Option<PathBuf>,

    /// Prompt cache capacity
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Maximum model context length
    #[arg(long)]
    pub max_model_len: Option<usize>,

    /// Skip the outbound connectivity probe
    #[arg(long)]
    pub skip_probe: bool,
}

impl ServeArgs {
    /// Build the effective configuration
    ///
    /// # Errors
    ///
    /// Unreadable or invalid config file
    pub fn to_config(&self) -> Result<ServeConfig> {
        let mut config = match &self.config {
            Some(path) => ServeConfig::from_json_file(path)?,
            None => ServeConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(model) = &self.model {
            config.engine.model_path.clone_from(model);
        }
        if let Some(name) = &self.served_model_name {
            config.engine.served_model_name = Some(name.clone());
        }
        if let Some(url) = &self.engine_url {
            config.engine.endpoint.clone_from(url);
        }
        if let Some(backend) = self.backend {
            config.engine.backend = backend;
        }
        if let Some(launcher) = &self.launcher {
            config.engine.launcher.clone_from(launcher);
        }
        if self.demo {
            config.engine.backend = EngineBackend::Demo;
        }
        if let Some(dataset) = &self.dataset {
            config.warmup.dataset_path.clone_from(dataset);
        }
        if let Some(capacity) = self.cache_capacity {
            config.cache_capacity = capacity;
        }
        if let Some(len) = self.max_model_len {
            config.engine.max_model_len = len;
        }
        Ok(config)
    }
}

/// Build the load-test configuration from `bench` arguments
#[must_use]
pub fn load_test_config(
    url: String,
    dataset: PathBuf,
    count: usize,
    timeout_secs: u64,
    focus: String,
    flag: String,
) -> LoadTestConfig {
    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
    LoadTestConfig {
        url,
        dataset,
        count,
        timeout: Duration::from_secs(timeout_secs),
        focus: non_empty(focus),
        flag: non_empty(flag),
        ..LoadTestConfig::default()
    }
}
