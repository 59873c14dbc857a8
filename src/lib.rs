//! congo: console aggregation server
//!
//! Keeps a registry of managed nodes, opens one live console per node
//! (a local command, `ssh`, or IPMI serial-over-LAN), and multiplexes it to
//! any number of attached viewers over a Unix socket.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod attach;
pub mod cli;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod manager;
pub mod node;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod testing;

pub use attach::{AttachError, EscapeDetector, run_console};
pub use cli::{Cli, Command, NodeAttrs, parse_key_values};
pub use client::{Client, ClientError, default_socket_path};
pub use config::{Config, ConfigError};
pub use driver::{Driver, DriverError, DriverHandle, DriverKind, Drivers};
pub use error::{ErrorKind, ManagerError};
pub use manager::{BulkResult, NodeManager, Outcome};
pub use node::{Node, NodeName, NodeUpdate};
pub use protocol::{Request, Response};
pub use server::{Server, ServerError};
pub use session::{CloseReason, SessionRegistry, SessionState};
pub use storage::{Storage, StorageError};
pub use testing::{PipeDriver, TestError, TestHarness};
