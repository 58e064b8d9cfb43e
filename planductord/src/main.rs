//! Planductor dispatcher daemon.
//!
//! Serves the configured task list to workers until interrupted, then logs
//! the final registry state and optionally writes it out as JSON.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use planductor_common::tls;
use planductord::{load_config, seed_registry, Dispatcher, TaskRecord, TaskRegistry};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "planductord", version)]
#[command(about = "Hands planning tasks to workers and records their results")]
struct Cli {
    /// Path to planductord.toml (or use PLANDUCTOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listening address, overrides [dispatcher] bind
    #[arg(long)]
    bind: Option<String>,

    /// Write the final registry as JSON here on shutdown
    #[arg(long)]
    results_out: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    info!("planductord version {}", DAEMON_VERSION);

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("PLANDUCTOR_CONFIG").ok().map(PathBuf::from));
    let mut config = load_config(config_path.as_deref());
    if let Some(bind) = cli.bind {
        config.dispatcher.bind = bind;
    }

    let acceptor = match &config.tls {
        Some(settings) => Some(
            tls::acceptor(&settings.cert_file, &settings.key_file)
                .context("failed to load TLS certificate and key")?,
        ),
        None => {
            warn!("TLS is not configured; workers will connect in plain text");
            None
        }
    };

    let registry = seed_registry(config.tasks);
    let dispatcher = Dispatcher::bind(&config.dispatcher, acceptor, registry)
        .await
        .with_context(|| format!("failed to bind {}", config.dispatcher.bind))?;

    let registry = dispatcher.run(shutdown_signal()).await;

    if let Some(path) = cli.results_out {
        write_results(&registry, &path)?;
        info!("Registry written to {}", path.display());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C, running until killed: {}", err);
        std::future::pending::<()>().await;
    }
}

fn write_results(registry: &TaskRegistry, path: &Path) -> Result<()> {
    let records: Vec<&TaskRecord> = registry.iter().collect();
    let json = serde_json::to_string_pretty(&records).context("failed to encode registry")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
