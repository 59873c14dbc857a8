//! The congo server.
//!
//! Owns the node manager (and through it, storage and every live console).
//! Listens on a Unix socket for client requests.

use crate::error::ErrorKind;
use crate::manager::NodeManager;
use crate::protocol::{AttachEndReason, Request, Response};
use crate::session::{Viewer, ViewerEvent};
use bytes::Bytes;
#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Size of the client input buffer during attach.
const INPUT_BUF_SIZE: usize = 4096;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// The congo server.
pub struct Server {
    socket_path: PathBuf,
    manager: Arc<NodeManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a server that will listen on the given socket path. The manager
    /// must already be started.
    #[must_use]
    pub fn new(socket_path: PathBuf, manager: Arc<NodeManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            socket_path,
            manager,
            shutdown_tx,
        }
    }

    /// Handle that stops the server from outside the accept loop.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the server event loop until a shutdown request arrives.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Server listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            debug!("Accepted connection");
                            let manager = Arc::clone(&self.manager);
                            let shutdown_tx = self.shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, manager, shutdown_tx).await {
                                    error!(error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.manager.shutdown().await;
        std::fs::remove_file(&self.socket_path).ok();
        info!("Server shut down");
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        // Never follow a symlink planted at the socket path.
        if let Ok(metadata) = std::fs::symlink_metadata(&self.socket_path) {
            if metadata.file_type().is_symlink() {
                return Err(ServerError::Bind(std::io::Error::other(
                    "socket path is a symlink - possible security attack",
                )));
            }
            if metadata.file_type().is_socket() || metadata.file_type().is_file() {
                std::fs::remove_file(&self.socket_path).ok();
            }
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(ServerError::Io)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(ServerError::Bind)?;

        // Owner-only access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms).map_err(ServerError::Io)?;
        }

        Ok(listener)
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<(), ServerError> {
    let mut json = serde_json::to_string(response).map_err(ServerError::Encode)?;
    json.push('\n');
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(ServerError::Io)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: UnixStream,
    manager: Arc<NodeManager>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(ServerError::Io)?;

        if n == 0 {
            debug!("Client disconnected");
            break;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let response = Response::error(
                    ErrorKind::InvalidArgument,
                    format!("invalid request: {e}"),
                );
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        debug!(?request, "Received request");

        // Attach switches the connection to streaming mode for good.
        if let Request::Attach { name } = &request {
            if let Err(e) = handle_attach(name, reader, writer, &manager).await {
                warn!(node = %name, error = %e, "Attach session error");
            }
            return Ok(());
        }

        let is_shutdown = matches!(request, Request::Shutdown);
        let response = handle_request(request, &manager).await;
        write_response(&mut writer, &response).await?;

        if is_shutdown {
            let _ = shutdown_tx.send(());
            break;
        }
    }

    Ok(())
}

/// Handle a single request.
async fn handle_request(request: Request, manager: &NodeManager) -> Response {
    let result = match request {
        Request::Ping => return Response::Pong,

        Request::List => Ok(Response::Nodes {
            nodes: manager.list_nodes().await,
        }),

        Request::ListHosts => Ok(Response::Hosts {
            hosts: manager.list_nodes_with_host().await,
        }),

        Request::Show { name } => match manager.show_node(&name).await {
            Ok(node) => Ok(Response::Node {
                console: manager.console_state(&name).await,
                node,
                warning: None,
            }),
            Err(e) => Err(e),
        },

        Request::Create { node } => {
            let name = node.name.clone();
            manager
                .create_node(node)
                .await
                .map(|warning| Response::Created { name, warning })
        }

        Request::CreateBulk { nodes } => Ok(Response::Bulk {
            result: manager.create_nodes(nodes).await,
        }),

        Request::Update { name, update } => match manager.update_node(&name, &update).await {
            Ok((node, warning)) => Ok(Response::Node {
                console: manager.console_state(&name).await,
                node,
                warning,
            }),
            Err(e) => Err(e),
        },

        Request::Delete { name } => manager.delete_node(&name).await.map(|()| Response::Ok),

        Request::DeleteBulk { nodes } => Ok(Response::Bulk {
            result: manager.delete_nodes(nodes).await,
        }),

        Request::SetState { nodes, state } => manager
            .set_console_state(nodes, &state)
            .await
            .map(|result| Response::Bulk { result }),

        Request::Logging { name, on } => manager.set_logging(&name, on).await.map(|()| Response::Ok),

        Request::Tail { name, bytes } => manager
            .tail(&name, bytes)
            .await
            .map(|data| Response::Output { data }),

        // Handled by the connection loop.
        Request::Attach { .. } => Ok(Response::error(
            ErrorKind::Internal,
            "attach must be the first request on its connection",
        )),

        Request::Shutdown => {
            info!("Shutdown requested");
            Ok(Response::Ok)
        }
    };

    result.unwrap_or_else(|e| {
        debug!(error = %e, "Request failed");
        Response::from(&e)
    })
}

/// Handle attach mode - streaming I/O between the client and a console.
async fn handle_attach(
    name: &str,
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    manager: &NodeManager,
) -> Result<(), ServerError> {
    let mut viewer = match manager.attach(name).await {
        Ok(viewer) => viewer,
        Err(e) => {
            return write_response(&mut writer, &Response::from(&e)).await;
        }
    };

    let response = Response::AttachStarted {
        name: name.to_string(),
        writable: viewer.is_writer(),
    };
    write_response(&mut writer, &response).await?;
    info!(node = %name, viewer = viewer.id(), "Attach started");

    let result = run_attach_bridge(name, &mut viewer, &mut reader, &mut writer).await;
    drop(viewer);

    let reason = result.unwrap_or_else(|e| AttachEndReason::Error {
        message: e.to_string(),
    });
    info!(node = %name, ?reason, "Attach ended");

    write_response(&mut writer, &Response::AttachEnded { reason }).await.ok();
    writer.shutdown().await.ok();
    Ok(())
}

/// Pump client input into the console and console output to the client until
/// either side goes away.
async fn run_attach_bridge(
    name: &str,
    viewer: &mut Viewer,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> Result<AttachEndReason, ServerError> {
    let mut input_buf = [0u8; INPUT_BUF_SIZE];

    loop {
        tokio::select! {
            result = reader.read(&mut input_buf) => {
                match result {
                    Ok(0) => {
                        debug!(node = %name, "Client detached");
                        return Ok(AttachEndReason::Detached);
                    }
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&input_buf[..n]);
                        match viewer.send(data).await {
                            Ok(true) => {}
                            Ok(false) => debug!(node = %name, bytes = n, "Dropped input from read-only viewer"),
                            Err(e) => return Ok(AttachEndReason::Error { message: e.to_string() }),
                        }
                    }
                    Err(e) => return Err(ServerError::Io(e)),
                }
            }

            event = viewer.recv() => {
                match event {
                    ViewerEvent::Output(data) => {
                        writer.write_all(&data).await.map_err(ServerError::Io)?;
                    }
                    ViewerEvent::Lagged(skipped) => {
                        warn!(node = %name, skipped, "Viewer fell behind, output dropped");
                    }
                    ViewerEvent::Ended(reason) => {
                        return Ok(AttachEndReason::ConsoleClosed { reason });
                    }
                }
            }
        }
    }
}

/// Check if a server is running by trying to connect.
pub async fn is_server_running(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).await.is_ok()
}
