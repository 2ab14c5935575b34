//! infergate CLI - batch inference gateway
//!
//! # Commands
//!
//! - `serve` - Warm up the engine and serve `/predict`
//! - `pull` - Download a model snapshot from the hub
//! - `bench` - Load-test a running server with the evaluation dataset
//! - `info` - Show version and defaults

use clap::Parser;
use infergate::cli::{entrypoint, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = entrypoint(cli).await {
        tracing::error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
