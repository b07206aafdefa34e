//! IPC Server - Unix socket server for store clients
//!
//! Handles incoming connections and dispatches commands to the DataService.
//! Store operations block on disk I/O, so each one runs on tokio's blocking
//! pool rather than on the connection task.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::ipc::protocol::{
    decode_data, parse_command, serialize_response, Command, Response, PROTOCOL_VERSION,
};
use crate::service::DataService;
use crate::store;

/// IPC Server that listens for store commands
pub struct IpcServer {
    /// Service answering node and blob commands
    service: Arc<DataService>,
    /// Socket file path
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(service: Arc<DataService>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            service,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    /// Start the IPC server
    pub async fn start(&mut self) -> Result<()> {
        // Clean up any existing socket file
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

        info!(socket_path = %self.socket_path.display(), "IPC server started");

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let service = Arc::clone(&self.service);
                    let connection_count = Arc::clone(&self.connection_count);

                    // Spawn a new task to handle this connection
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub fn stop(&self) -> Result<()> {
        remove_socket(&self.socket_path)?;
        info!("IPC server stopped");
        Ok(())
    }
}

fn remove_socket(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove socket file")?;
    }
    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    service: Arc<DataService>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Read commands line by line (newline-delimited JSON)
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &service, &connection_count).await,
                    Err(e) => {
                        error!(error = %e, "Failed to parse command");
                        Response::invalid(format!("Invalid command: {}", e))
                    }
                };

                match serialize_response(&response) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write response");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize response");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Run a store operation on the blocking pool, mapping failures to a response
async fn run_blocking<T, F>(service: &Arc<DataService>, op: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce(&DataService) -> store::Result<T> + Send + 'static,
{
    let service = Arc::clone(service);
    match tokio::task::spawn_blocking(move || op(&service)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            debug!(error = %e, "Store operation failed");
            Err(Response::from(e))
        }
        Err(e) => {
            error!(error = %e, "Store task panicked");
            Err(Response::Error {
                error: format!("Internal error: {}", e),
                code: "ioFailure".to_string(),
            })
        }
    }
}

/// Process a command and return a response
async fn process_command(
    command: Command,
    service: &Arc<DataService>,
    connection_count: &Arc<RwLock<u32>>,
) -> Response {
    match command {
        Command::GetNode { node_id } => {
            debug!(node = %node_id, "Processing getNode command");
            let id = node_id.clone();
            match run_blocking(service, move |s| s.get_node(&id)).await {
                Ok(value) => Response::Node { node_id, value },
                Err(response) => response,
            }
        }

        Command::SetNode { node_id, value } => {
            debug!(node = %node_id, "Processing setNode command");
            let id = node_id.clone();
            match run_blocking(service, move |s| s.set_node(&id, value)).await {
                Ok(()) => Response::success(format!("Saved node {}", node_id)),
                Err(response) => response,
            }
        }

        Command::DeleteNode { node_id } => {
            info!(node = %node_id, "Processing deleteNode command");
            let id = node_id.clone();
            match run_blocking(service, move |s| s.delete_node(&id)).await {
                Ok(()) => Response::success(format!("Deleted node {}", node_id)),
                Err(response) => response,
            }
        }

        Command::PutBlob { name, data } => {
            let content = match decode_data(&data) {
                Ok(content) => content,
                Err(e) => return Response::invalid(format!("Invalid base64 data: {}", e)),
            };
            debug!(blob = %name, size = content.len(), "Processing putBlob command");
            match run_blocking(service, move |s| s.put_blob(&name, &content)).await {
                Ok(stored) => Response::success(format!("Stored blob {}", stored)),
                Err(response) => response,
            }
        }

        Command::GetBlob { name } => {
            debug!(blob = %name, "Processing getBlob command");
            match run_blocking(service, move |s| s.get_blob(&name)).await {
                Ok(blob) => Response::blob(blob),
                Err(response) => response,
            }
        }

        Command::DeleteBlob { name } => {
            info!(blob = %name, "Processing deleteBlob command");
            let blob = name.clone();
            match run_blocking(service, move |s| s.delete_blob(&blob)).await {
                Ok(()) => Response::success(format!("Deleted blob {}", name)),
                Err(response) => response,
            }
        }

        Command::Flush { node_id: Some(node_id) } => {
            debug!(node = %node_id, "Processing flush command");
            let id = node_id.clone();
            match run_blocking(service, move |s| s.flush_node(&id)).await {
                Ok(true) => Response::success(format!("Flushed node {}", node_id)),
                Ok(false) => Response::success(format!("Node {} had no pending changes", node_id)),
                Err(response) => response,
            }
        }

        Command::Flush { node_id: None } => {
            debug!("Processing flush command");
            match run_blocking(service, |s| Ok(s.flush_all())).await {
                Ok(flushed) => Response::success(format!("Flushed {} nodes", flushed)),
                Err(response) => response,
            }
        }

        Command::GetStatus => {
            debug!("Processing getStatus command");
            let connections = *connection_count.read().await;
            match run_blocking(service, |s| Ok(s.stats())).await {
                Ok(stats) => Response::Status {
                    version: PROTOCOL_VERSION,
                    healthy: true,
                    connections,
                    stats,
                },
                Err(response) => response,
            }
        }
    }
}
