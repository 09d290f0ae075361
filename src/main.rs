//! Socket Hub
//!
//! WebSocket broadcast server. Speaks the frame protocol directly on
//! upgraded TCP connections and relays every message a client sends to all
//! connected clients.

mod config;
mod connection;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use config::{ServerConfig, DEFAULT_CONFIG_FILE};
use server::WebSocketServer;

/// Socket Hub
///
/// WebSocket broadcast server
#[derive(Parser, Debug)]
#[command(name = "socket-hub")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Accept upgrade requests without an Origin header
    #[arg(long)]
    allow_missing_origin: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Socket Hub v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load_or_default(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if args.allow_missing_origin {
        config = config.with_require_origin(false);
    }

    // Create and start the WebSocket server
    let server = Arc::new(WebSocketServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
