//! Planductor worker process.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use planductor_worker::{load_settings, IdlePolicy, WorkerSession};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "planductor-worker", version)]
#[command(about = "Runs planning tasks handed out by planductord")]
struct Cli {
    /// Path to planductor-worker.toml (or use PLANDUCTOR_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dispatcher host (or use PLANDUCTOR_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Dispatcher port (or use PLANDUCTOR_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Keep polling when the dispatcher has no task instead of exiting
    #[arg(long)]
    poll: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("PLANDUCTOR_CONFIG").ok().map(PathBuf::from));
    let mut settings = load_settings(config_path.as_deref());

    if let Some(host) = cli
        .host
        .or_else(|| std::env::var("PLANDUCTOR_HOST").ok())
    {
        settings.dispatcher.host = host;
    }
    match cli.port {
        Some(port) => settings.dispatcher.port = port,
        None => {
            if let Ok(raw) = std::env::var("PLANDUCTOR_PORT") {
                match raw.trim().parse::<u16>() {
                    Ok(port) => settings.dispatcher.port = port,
                    Err(err) => warn!("Invalid PLANDUCTOR_PORT value '{}': {}", raw, err),
                }
            }
        }
    }
    if cli.poll {
        settings.session.idle = IdlePolicy::Poll;
    }

    info!(
        dispatcher = %settings.dispatcher.address(),
        tls = settings.dispatcher.ca_file.is_some(),
        idle = ?settings.session.idle,
        "planductor-worker version {}",
        env!("CARGO_PKG_VERSION")
    );

    let session = WorkerSession::from_settings(&settings)?;
    session
        .run()
        .await
        .with_context(|| format!("lost the dispatcher at {}", settings.dispatcher.address()))?;
    Ok(())
}
