//! charfinder-server: find Unicode characters by name over TCP
//!
//! Clients connect, get a `?> ` prompt, and send words describing a
//! character; the server answers with every character whose name contains
//! all of them, followed by a match count.
//!
//! Features:
//! - Index built in the background; the server accepts connections at once
//!   and reports "still loading" until the index is ready
//! - Builtin name table or a UnicodeData.txt file
//! - Graceful shutdown on Ctrl-C / SIGTERM, letting open sessions finish
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod error;
mod index;
mod loader;
mod protocol;
mod registry;
mod server;

use config::Config;
use error::ServerError;
use loader::LoadOutcome;
use server::{Server, Shutdown, ShutdownReport};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        index_source = ?config.index_source,
        warmup_ms = config.warmup.as_millis() as u64,
        "Starting charfinder-server"
    );

    let result = build_runtime(config.workers)
        .map_err(ServerError::from)
        .and_then(|runtime| runtime.block_on(serve(config)));

    match result {
        Ok(report) => {
            match &report.load {
                LoadOutcome::Ready { elapsed } => {
                    info!(load_ms = elapsed.as_millis() as u64, "Index was loaded")
                }
                LoadOutcome::Failed(e) => warn!(error = %e, "Index never loaded"),
            }
            info!(abandoned = report.abandoned_connections, "Exiting");
            println!("Shutdown complete.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Single-threaded event loop by default; a thread pool when `workers > 1`.
fn build_runtime(workers: usize) -> std::io::Result<tokio::runtime::Runtime> {
    if workers <= 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .enable_all()
            .build()
    }
}

async fn serve(config: Config) -> Result<ShutdownReport, ServerError> {
    let server = Server::bind(config).await?;
    println!(
        "Serving on {}. Hit CTRL-C to stop.",
        server.local_addr()
    );

    let shutdown = Shutdown::new();
    let signals = tokio::spawn(server::watch_signals(shutdown.clone()));

    let report = server.run(shutdown).await;
    signals.abort();
    report
}
