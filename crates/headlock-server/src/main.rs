//! Headlock server - lets a human operator drive an AI agent session by session.
//!
//! Agents block on `enter`/`continue` (HTTP or MCP) until the operator sends
//! an instruction over HTTP or WebSocket.

mod error;
mod maintenance;
mod mcp;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use headlock_core::{Config, ConfigManager, Coordinator};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::maintenance::MaintenancePolicy;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "headlock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session rendezvous between AI agents and a human operator", long_about = None)]
struct Args {
    /// Address to bind the server to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file (defaults to <config dir>/headlock/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Default agent wait timeout in seconds
    #[arg(long)]
    wait_timeout: Option<u64>,

    /// Maximum number of registered sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (config, config_warning) = load_config(&args)?;
    init_tracing(&config, args.verbose);
    if let Some(warning) = config_warning {
        warn!("{}", warning);
    }

    let config = apply_overrides(config, &args);

    let coordinator = Arc::new(Coordinator::new(config.sessions.coordinator_config()));
    let shutdown = CancellationToken::new();

    if let Some(policy) = MaintenancePolicy::from_config(&config.sessions) {
        maintenance::spawn(coordinator.clone(), policy, shutdown.clone());
    }

    let app = routes::create_router(AppState::new(coordinator, shutdown.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Headlock listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Explicit `--config` must load; the default path may be unavailable
fn load_config(args: &Args) -> anyhow::Result<(Config, Option<String>)> {
    match &args.config {
        Some(path) => Ok((ConfigManager::with_path(path.clone())?.into_config(), None)),
        None => match ConfigManager::new() {
            Ok(manager) => Ok((manager.into_config(), None)),
            Err(e) => Ok((Config::default(), Some(format!("Using default config: {}", e)))),
        },
    }
}

fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(timeout) = args.wait_timeout {
        config.sessions.wait_timeout_secs = Some(timeout);
    }
    if let Some(max) = args.max_sessions {
        config.sessions.max_sessions = Some(max);
    }
    config
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let directives = format!("headlock={level},headlock_core={level},headlock_mcp={level}");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C and releases every held-open request
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        // Keep serving; only an explicit cancel stops us now
        shutdown.cancelled().await;
        return;
    }
    info!("Shutting down");
    shutdown.cancel();
}
