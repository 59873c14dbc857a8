//! Client for communicating with the congo server.

#![allow(unsafe_code)] // getuid() call

use crate::protocol::{Request, Response};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, warn};

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to server at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send request: {0}")]
    Send(#[source] std::io::Error),

    #[error("failed to receive response: {0}")]
    Receive(#[source] std::io::Error),

    #[error("failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize response: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("connection lost")]
    ConnectionLost,
}

/// Get the default socket path for the congo server.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime_dir) = dirs::runtime_dir() {
        runtime_dir.join("congo.sock")
    } else {
        // Fallback to /tmp/congo-$UID.sock
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/congo-{uid}.sock"))
    }
}

/// Client for the congo server.
pub struct Client {
    socket_path: PathBuf,
    stream: Option<BufReader<UnixStream>>,
}

impl Client {
    /// Create a new client that will connect to the given socket path.
    #[must_use]
    pub const fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            stream: None,
        }
    }

    /// Create a client with the default socket path.
    #[must_use]
    pub fn with_default_path() -> Self {
        Self::new(default_socket_path())
    }

    /// Connect to the server if not connected yet.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ClientError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        debug!(socket = %self.socket_path.display(), "Connected to server");
        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    /// Send a request to the server and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        self.connect().await?;
        let stream = self.stream.as_mut().ok_or(ClientError::ConnectionLost)?;
        let response = exchange(stream, &request).await?;

        if let Response::Error { kind, message } = &response {
            warn!(%kind, "Server returned error: {}", message);
        }
        Ok(response)
    }

    /// Send an attach request. On `attach_started` the connection is handed
    /// back for streaming, along with anything already buffered from it.
    pub async fn attach(
        mut self,
        name: &str,
    ) -> Result<(Response, Option<BufReader<UnixStream>>), ClientError> {
        self.connect().await?;
        let mut stream = self.stream.take().ok_or(ClientError::ConnectionLost)?;
        let response = exchange(
            &mut stream,
            &Request::Attach {
                name: name.to_string(),
            },
        )
        .await?;

        if matches!(response, Response::AttachStarted { .. }) {
            Ok((response, Some(stream)))
        } else {
            Ok((response, None))
        }
    }

    /// Get the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

async fn exchange(
    stream: &mut BufReader<UnixStream>,
    request: &Request,
) -> Result<Response, ClientError> {
    let mut json = serde_json::to_string(request).map_err(ClientError::Serialize)?;
    json.push('\n');

    stream
        .get_mut()
        .write_all(json.as_bytes())
        .await
        .map_err(ClientError::Send)?;

    let mut line = String::new();
    let n = stream
        .read_line(&mut line)
        .await
        .map_err(ClientError::Receive)?;

    if n == 0 {
        return Err(ClientError::ConnectionLost);
    }

    serde_json::from_str(&line).map_err(ClientError::Deserialize)
}
