//! Gateway Daemon - HTTP front end for the LLM gateway
//!
//! Loads the gateway configuration, builds the pipeline orchestrator, and
//! serves the canonical Messages API plus health and admin endpoints.
//!
//! # Usage
//!
//! ```bash
//! # Default config ($XDG_CONFIG_HOME/llm-gateway/gateway.toml)
//! gateway-daemon
//!
//! # Explicit config and listen address
//! gateway-daemon --config ./gateway.toml --listen 0.0.0.0:8787
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop accepting connections, cancel every in-flight
//!   request, and exit once open connections have drained

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gateway_core::{default_config_path, load_config_from_path, PipelineOrchestrator};

/// Gateway Daemon - routes Messages API requests to upstream LLM providers
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides [server] listen and GATEWAY_LISTEN)
    #[arg(short = 'L', long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Cancel `shutdown` and the orchestrator on the first SIGINT or SIGTERM
fn spawn_signal_handler(
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        // Ends open streams; the HTTP drain waits on them
        orchestrator.shutdown();
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load gateway configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
        config.set_source(gateway_core::ConfigSource::Cli);
    }
    info!(
        path = ?config.config_file_path,
        source = %config.source(),
        endpoints = config.endpoints.len(),
        "Configuration loaded"
    );

    let orchestrator =
        Arc::new(PipelineOrchestrator::new(&config).context("Failed to build orchestrator")?);
    orchestrator.start();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(Arc::clone(&orchestrator), shutdown.clone())?;

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.listen))?;

    let result = server::serve(listener, Arc::clone(&orchestrator), shutdown).await;
    orchestrator.shutdown();

    match result {
        Ok(()) => {
            info!("Gateway daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Gateway daemon stopped with error");
            Err(e)
        }
    }
}
