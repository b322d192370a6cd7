//! compiler-rpc - per-session container sandboxes over HTTP.
//!
//! Usage:
//!   compiler-rpc serve [--port 8080] [--auth-file auth.keys] [--rotate-keys]
//!   compiler-rpc --log-file serve             # also log to a timestamped file

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use compiler_rpc::config::ServeConfig;
use compiler_rpc::docker::DockerBackend;
use compiler_rpc::http_server;
use compiler_rpc::keystore::{KeySet, KeyStoreError};
use compiler_rpc::session::SessionStore;
use compiler_rpc::state::AppState;
use std::fs::File;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "compiler-rpc")]
#[command(about = "Per-session container sandboxes over HTTP")]
struct Args {
    /// Duplicate logs to a timestamped file in the working directory
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeConfig),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(problem) = init_tracing(args.log_file) {
        warn!("{}", problem);
        info!("Continuing without file logging");
    }

    match args.command {
        Commands::Serve(config) => serve(config).await,
    }
}

/// Install the stdout subscriber, plus a file layer when asked. Returns a
/// message to log if the file could not be created.
fn init_tracing(log_to_file: bool) -> Option<String> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut problem = None;
    let file_layer = if log_to_file {
        let name = chrono::Local::now()
            .format("%Y-%m-%d %H_%M_%S %z.log")
            .to_string();
        match File::create(&name) {
            Ok(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(e) => {
                problem = Some(format!("Unable to create log file {name}: {e}"));
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    problem
}

async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    config.validate()?;

    let keys = match KeySet::load(&config.auth_file, config.rotate_keys, config.key_length) {
        Err(e @ KeyStoreError::Io { .. }) if config.rotate_keys => {
            warn!(error = %e, "Key rotation failed, continuing with existing keys");
            KeySet::load(&config.auth_file, false, config.key_length)
        }
        other => other,
    }
    .context("loading auth keys")?;
    info!(path = %keys.path().display(), keys = keys.keys().len(), "Loaded session keys");

    let sessions =
        SessionStore::new(&keys).map_err(|e| anyhow!("unusable session key: {e:?}"))?;

    let backend = DockerBackend::new(&config.docker_host).context("creating engine client")?;
    info!(endpoint = backend.endpoint(), "Using container engine");

    let limits = config.limits();
    info!(?limits, "Sandbox resource limits");

    let state = AppState::new(sessions, Arc::new(backend), limits, &config.app_dir);
    http_server::run_server(config.port, state, config.request_timeout()).await?;
    Ok(())
}
