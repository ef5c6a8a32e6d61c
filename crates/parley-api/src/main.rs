//! Parley gateway entry point.
//!
//! Binary name: `parley`
//!
//! Parses CLI arguments, loads configuration, initializes the database and
//! turn coordinator, then starts the REST/WebSocket server.

mod http;
mod state;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use parley_infra::config::load_config;
use state::AppState;

/// Multi-protocol chat gateway.
#[derive(Parser)]
#[command(name = "parley", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Suppress all output except errors.
    #[arg(long, global = true)]
    quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Serve {
        /// Listen address override (e.g. "0.0.0.0:8080"). Defaults to the
        /// configured `listen_addr`.
        #[arg(long)]
        listen: Option<String>,

        /// Data directory holding config.toml and the SQLite database.
        /// Defaults to $PARLEY_DATA_DIR, then ~/.parley.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Verbosity presets; RUST_LOG takes priority when set.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => parley_observe::tracing_setup::DEFAULT_FILTER,
        _ => "trace",
    };

    match cli.command {
        Commands::Serve { listen, data_dir } => serve(filter, listen, data_dir).await,
    }
}

async fn serve(
    filter: &str,
    listen: Option<String>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let data_dir = resolve_data_dir(data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let config = load_config(&data_dir).await;

    parley_observe::tracing_setup::init_tracing(filter, config.enable_otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let state = AppState::init(config).await?;
    let router = http::router::build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "Parley gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    parley_observe::tracing_setup::shutdown_tracing();
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolve the data directory: CLI flag, then $PARLEY_DATA_DIR, then
/// ~/.parley.
fn resolve_data_dir(cli_dir: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = cli_dir {
        return dir;
    }
    if let Ok(dir) = std::env::var("PARLEY_DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".parley")
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
