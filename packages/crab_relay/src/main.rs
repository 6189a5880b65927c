use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use crab_relay::config::{FileConfig, load_config};
use crab_relay::{AppState, RelayConfig, app};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "WebSocket relay that fans out text and files between connected clients")]
struct Args {
    /// Path to a relay.toml config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the HTTP server, 0 for automatic (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Store received files in this directory
    #[arg(long)]
    persist_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_directive = if args.debug {
        "crab_relay=debug,tower_http=debug,info"
    } else {
        "crab_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    if let Some(dir) = args.persist_dir {
        file_config.relay.persist_dir = Some(dir);
    }

    let state = AppState::new(RelayConfig::from_file(&file_config.relay));
    if let Some(store) = &state.store {
        info!("Persisting received files to {}", store.dir().display());
    }

    let bind = format!("{}:{}", file_config.server.host, file_config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let actual_addr = listener.local_addr()?;

    info!("Relay listening on ws://{}/ws", actual_addr);
    info!("  GET /ws          - WebSocket relay");
    info!("  GET /health      - Health status");
    info!("  GET /metrics     - Relay counters");

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, closing connections...");
        shutdown_state.shutdown().await;
    };

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    info!("Relay stopped");
    Ok(())
}
