use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use fabric_router::{config::RouterConfig, Router};
use tracing::level_filters::LevelFilter;

/// Runs a router that accepts bonded control channels and links.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the router configuration (`.toml` or `.json`).
    #[arg(long, env = "FABRIC_CONFIG")]
    config: PathBuf,

    /// Overrides the configured log level.
    #[arg(long, env = "FABRIC_LOG_LEVEL")]
    log_level: Option<LevelFilter>,
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    let router = Router::new(config);
    for (address, groups) in router.config().ctrl.listeners.iter() {
        tracing::info!(%address, ?groups, "Ctrl channel listener configured");
    }
    let mut reconnects = router.subscribe_reconnects();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                break;
            }
            Some(event) = reconnects.recv() => {
                tracing::info!(
                    address = %event.address,
                    channel = %event.logical_name,
                    members = event.members,
                    "Ctrl channel reconnected"
                );
            }
        }
    }

    router.shutdown().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RouterConfig::load(&cli.config)?;
    let level = match cli.log_level {
        Some(level) => Some(level),
        None => config.log_level()?,
    };
    fabric_router::tracing::tracer::init_tracer(level)?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;
    rt.block_on(run(config))
}
