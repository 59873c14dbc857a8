//! Protocol types for client-server IPC.
//!
//! All communication between the congo CLI (client) and the congo server
//! happens over a Unix socket using newline-delimited JSON Request/Response
//! messages.

use crate::error::{ErrorKind, ManagerError};
use crate::manager::BulkResult;
use crate::node::{Node, NodeName, NodeUpdate};
use crate::session::{CloseReason, SessionState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Requests from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Ping the server (for health checks).
    Ping,

    /// List all nodes.
    List,

    /// Node name to host map.
    ListHosts,

    /// Show one node and its console state.
    Show { name: String },

    /// Register a node.
    Create { node: Node },

    /// Register many nodes at once.
    CreateBulk { nodes: Vec<Node> },

    /// Replace a node's params and/or on-demand flag.
    Update {
        name: String,
        #[serde(flatten)]
        update: NodeUpdate,
    },

    /// Remove a node, closing its console first.
    Delete { name: String },

    /// Remove many nodes at once.
    DeleteBulk { nodes: Vec<NodeName> },

    /// Open or close the consoles of many nodes.
    SetState {
        nodes: Vec<NodeName>,
        /// `"open"` or `"close"`.
        state: String,
    },

    /// Toggle output recording for a node.
    Logging { name: String, on: bool },

    /// Recent console output.
    Tail {
        name: String,
        /// Number of bytes to return.
        #[serde(default = "default_tail_bytes")]
        bytes: usize,
    },

    /// Attach to a node's console (interactive mode).
    /// This switches the connection to streaming mode.
    Attach { name: String },

    /// Request server shutdown.
    Shutdown,
}

/// Responses from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Generic success with no data.
    Ok,

    /// Pong response to Ping.
    Pong,

    /// Every node, sorted by name.
    Nodes { nodes: Vec<Node> },

    /// Node name to `host` param.
    Hosts { hosts: BTreeMap<String, String> },

    /// A single node.
    Node {
        node: Node,
        /// State of the node's console, when one is live.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        console: Option<SessionState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },

    /// A node was registered.
    Created {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },

    /// Per-name outcomes of a bulk request.
    Bulk { result: BulkResult },

    /// Raw output bytes (for tail).
    Output {
        /// Output data (base64 encoded in JSON).
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Attach mode started - connection switches to streaming.
    /// After this response, the protocol changes:
    /// - Client sends raw bytes which go to the console (if it holds the
    ///   write token)
    /// - Server sends raw console output bytes
    /// - Closing the client's write half signals detach
    /// - The server finishes with an `AttachEnded` line
    AttachStarted {
        name: String,
        /// Whether this viewer's input reaches the console.
        writable: bool,
    },

    /// Attach mode ended (sent after detach or console close).
    AttachEnded { reason: AttachEndReason },

    /// Error response.
    Error { kind: ErrorKind, message: String },
}

/// Reason attach mode ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachEndReason {
    /// User requested detach.
    Detached,
    /// The console went away.
    ConsoleClosed { reason: CloseReason },
    /// An error occurred.
    Error { message: String },
}

/// Prefix of the line that terminates an attach stream.
pub const ATTACH_ENDED_MARKER: &[u8] = br#"{"type":"attach_ended""#;

impl Response {
    /// Create an error response.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ManagerError> for Response {
    fn from(e: &ManagerError) -> Self {
        Self::error(e.kind(), e.to_string())
    }
}

const fn default_tail_bytes() -> usize {
    4096
}

/// Module for base64 encoding/decoding of byte vectors in serde.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
