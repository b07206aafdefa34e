//! NodeStore Daemon - write-back node state cache and blob store
//!
//! Serves per-node JSON documents and named blobs from a local data
//! directory to clients on a Unix socket.

mod cache;
mod config;
mod ipc;
mod service;
mod store;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::DaemonConfig;
use ipc::IpcServer;
use service::DataService;
use store::{DataLayout, PersistentStore};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    /// Print a node's durable document (CLI mode)
    Get { node_id: String },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"NodeStore Daemon - node state cache and blob store

USAGE:
    nodestore-daemon                 # Run IPC server (default)
    nodestore-daemon get <node_id>
    nodestore-daemon help

COMMANDS:
    (none)  Run IPC server mode
    get     Print the document stored on disk for a node
    help    Show this help message

ENVIRONMENT:
    NODESTORE_DATA_DIR              Data directory (default: ./data)
    NODESTORE_SOCKET                Socket path (default: <runtime dir>/nodestore.sock)
    NODESTORE_WRITE_DELAY_SECS      Minimum seconds between writes of one node (default: 5)
    NODESTORE_FLUSH_INTERVAL_SECS   Background flush period, 0 disables (default: 1)
    RUST_LOG                        Log filter (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Server);
    }

    match args[1].as_str() {
        "get" => {
            if args.len() < 3 {
                return Err(anyhow!("Usage: nodestore-daemon get <node_id>"));
            }
            Ok(Command::Get {
                node_id: args[2].clone(),
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

/// Periodically write out nodes whose debounce window has passed
fn spawn_flush_task(service: Arc<DataService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let service = Arc::clone(&service);
            if let Err(e) = tokio::task::spawn_blocking(move || service.flush_due()).await {
                error!(error = %e, "Background flush task failed");
            }
        }
    })
}

/// Install SIGINT and SIGTERM handlers
///
/// The returned future resolves with the name of the first one received.
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let config = DaemonConfig::from_env()?;

    match command {
        Command::Server => {
            info!(
                data_dir = %config.data_dir.display(),
                "Starting NodeStore daemon in IPC server mode"
            );

            let service = Arc::new(
                DataService::open(&config.data_dir, config.write_delay)
                    .context("Failed to open data directory")?,
            );

            let mut ipc_server = IpcServer::new(Arc::clone(&service), &config.socket_path);
            if let Err(e) = ipc_server.start().await {
                error!(error = %e, "Failed to start IPC server");
                return Err(e);
            }
            let ipc_server = Arc::new(ipc_server);

            let ipc_handle = {
                let ipc_server = Arc::clone(&ipc_server);
                tokio::spawn(async move {
                    if let Err(e) = ipc_server.run().await {
                        error!(error = %e, "IPC server error");
                    }
                })
            };

            let flush_handle = config
                .flush_interval
                .map(|interval| spawn_flush_task(Arc::clone(&service), interval));

            let shutdown = shutdown_signal()?;
            info!("Daemon ready. Waiting for commands...");

            let received = shutdown.await;

            info!(signal = received, "Received shutdown signal, flushing pending writes...");
            ipc_handle.abort();
            if let Some(handle) = flush_handle {
                handle.abort();
            }

            let flushing = Arc::clone(&service);
            tokio::task::spawn_blocking(move || flushing.flush_all())
                .await
                .context("Shutdown flush failed")?;

            ipc_server.stop()?;
            info!("Shutdown complete.");
        }
        Command::Get { node_id } => {
            let layout = DataLayout::new(&config.data_dir);
            let path = layout.node_document(&node_id)?;
            let value: serde_json::Value = PersistentStore::new()
                .read(&path)
                .with_context(|| format!("No document for node '{}'", node_id))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Help => {
            print_help();
        }
    }

    Ok(())
}
