use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use queuectl_core::QueuectlConfig;

mod cli;
mod commands;

const DEFAULT_LOG_FILTER: &str = "queuectl=info,queuectl_worker=info,queuectl_store=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout is reserved for command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();

    // explicit --config > QUEUECTL_CONFIG env > ~/.queuectl/queuectl.toml
    let config_path = args
        .config
        .clone()
        .or_else(|| std::env::var("QUEUECTL_CONFIG").ok());
    let config = QueuectlConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        QueuectlConfig::default()
    });

    commands::run(args.command, config).await
}
