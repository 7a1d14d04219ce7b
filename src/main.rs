//! TideKV server
//!
//! Loads the TOML config, builds the cache, restores the last snapshot and
//! serves JSON datagrams over TCP until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidekv::commands::CommandHandler;
use tidekv::connection::{handle_connection, ConnectionStats};
use tidekv::protocol::DatagramCodec;
use tidekv::{Cache, Config, SaveOutcome};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// TideKV - in-memory key-value cache with per-key expiry
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "tidekv.toml")]
    config: PathBuf,

    /// Host to bind to
    #[arg(long, env = "TIDEKV_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "TIDEKV_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    init_logging(&config.logging.level);
    info!("Starting TideKV v{}", tidekv::VERSION);

    let cache = Cache::new(config.cache_config()?)?;
    info!(mode = ?cache.mode(), "Cache initialized");

    let snapshot_path = config.snapshot_path();
    if let Some(path) = &snapshot_path {
        if config.snapshot.load_on_start {
            restore_snapshot(&cache, path).await;
        }
    }

    let stats = Arc::new(ConnectionStats::new());
    let codec = DatagramCodec::new(config.server.max_datagram_size);
    let handler = CommandHandler::new(cache.clone()).with_snapshot_path(snapshot_path.clone());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    tokio::select! {
        _ = accept_loop(listener, codec, handler, Arc::clone(&stats)) => {}
        _ = shutdown_signal() => {}
    }

    if let Some(path) = &snapshot_path {
        if config.snapshot.save_on_shutdown {
            log_save(path, cache.save(path).await);
        }
    }

    cache.shutdown().await?;
    info!(
        connections = stats
            .connections_accepted
            .load(std::sync::atomic::Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, stopping server...");
}

/// A missing or unreadable snapshot is not fatal; the server starts empty.
async fn restore_snapshot(cache: &Cache, path: &Path) {
    match cache.load(path).await {
        Ok(loaded) => info!(entries = loaded, path = %path.display(), "Snapshot restored"),
        Err(e) => warn!(error = %e, "Snapshot not restored"),
    }
}

fn log_save(path: &Path, outcome: SaveOutcome) {
    match &outcome.persistent {
        Ok(n) => info!(entries = n, path = %path.display(), "Persistent bucket saved"),
        Err(e) => error!(error = %e, "Persistent bucket not saved"),
    }
    match &outcome.volatile {
        Some(Ok(n)) => info!(entries = n, path = %path.display(), "Volatile bucket saved"),
        Some(Err(e)) => error!(error = %e, "Volatile bucket not saved"),
        None => {}
    }
}

async fn accept_loop(
    listener: TcpListener,
    codec: DatagramCodec,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);
                tokio::spawn(handle_connection(stream, addr, codec, handler, stats));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
