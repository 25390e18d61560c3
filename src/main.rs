#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # livegate
//!
//! Session server keeping reconnectable browser sessions alive across
//! websocket drops.
//!
//! ## Subcommands
//!
//! - `livegate serve` (default): run the HTTP/WS server
//!
//! ## API surface
//!
//! | Method | Path                          | Description                              |
//! |--------|-------------------------------|------------------------------------------|
//! | GET    | `/{path}`                     | Index page with a fresh session token    |
//! | GET    | `/rio/ws?sessionToken=<tok>`  | WebSocket for the session                |
//! | PUT    | `/rio/upload/{upload_token}`  | Multipart upload for a pending request   |
//! | GET    | `/rio/asset/temp/{asset_id}`  | Weakly hosted temporary asset            |
//! | GET    | `/rio/health`                 | Liveness probe                           |
//!
//! ## Signals (unix)
//!
//! - `SIGUSR1` closes the connection gate (new sessions wait)
//! - `SIGUSR2` reopens it
//! - `SIGINT` / `SIGTERM` shut down gracefully

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use livegate::{AppState, Config, ConnectionGate, StaticPages};

/// Session server for reconnectable browser sessions.
#[derive(Parser)]
#[command(name = "livegate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("livegate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Serving app {:?}, pages {:?}", config.app.name, config.app.pages);

    let app = Arc::new(StaticPages::from_config(&config.app));
    let state = AppState::new(config, app);

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", state.config.server.listen))?;

    #[cfg(unix)]
    let gate_task = spawn_gate_signals(state.gate.clone())?;

    let result = livegate::server::serve(listener, state, shutdown_signal()).await;

    #[cfg(unix)]
    gate_task.abort();

    info!("Goodbye");
    result
}

/// Toggle the connection gate from `SIGUSR1` (block) and `SIGUSR2` (unblock).
#[cfg(unix)]
fn spawn_gate_signals(gate: ConnectionGate) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut block = signal(SignalKind::user_defined1()).context("Failed to register SIGUSR1")?;
    let mut unblock = signal(SignalKind::user_defined2()).context("Failed to register SIGUSR2")?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(()) = block.recv() => gate.block(),
                Some(()) = unblock.recv() => gate.unblock(),
                else => break,
            }
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
