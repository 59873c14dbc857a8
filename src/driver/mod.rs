//! Console drivers.
//!
//! A driver turns a [`Node`] into a live bidirectional byte stream. The set of
//! driver kinds is closed ([`DriverKind`]); the implementation behind each kind
//! is registered once at startup in a [`Drivers`] table, which lets tests
//! substitute in-memory drivers without touching the session engine.

mod ipmi;
mod local;
pub mod pty;
mod ssh;

pub use ipmi::IpmiDriver;
pub use local::CmdDriver;
pub use pty::{ChildProcess, CommandLine, PtyError, PtyStream};
pub use ssh::SshDriver;

use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Time a console process gets to exit after SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Errors raised while starting a console.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("unknown driver: {0:?}")]
    UnknownKind(String),

    #[error("no driver registered for {0}")]
    Unregistered(DriverKind),

    #[error("{driver} driver requires the {param:?} parameter")]
    MissingParam { driver: DriverKind, param: &'static str },

    #[error("failed to spawn console process: {0}")]
    Spawn(#[source] PtyError),

    #[error("console unavailable: {0}")]
    Unavailable(String),
}

/// The supported driver kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Local command run through `sh -c`.
    Cmd,
    /// Remote shell over `ssh`.
    Ssh,
    /// IPMI serial-over-LAN through `ipmitool`.
    Ipmitool,
}

impl DriverKind {
    pub const ALL: [Self; 3] = [Self::Cmd, Self::Ssh, Self::Ipmitool];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cmd => "cmd",
            Self::Ssh => "ssh",
            Self::Ipmitool => "ipmitool",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DriverError::UnknownKind(s.to_string()))
    }
}

/// Byte stream to a node's console.
pub trait ConsoleIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConsoleIo for T {}

/// A started console: the stream plus whatever process backs it.
///
/// Dropping a handle without [`DriverHandle::stop`] kills and reaps the
/// process.
pub struct DriverHandle {
    io: Box<dyn ConsoleIo>,
    process: Option<ChildProcess>,
}

impl DriverHandle {
    /// Wrap a stream that needs no process cleanup.
    pub fn new(io: impl ConsoleIo + 'static) -> Self {
        Self {
            io: Box::new(io),
            process: None,
        }
    }

    /// Wrap a console process spawned on a PTY.
    #[must_use]
    pub fn from_pty(stream: PtyStream, process: ChildProcess) -> Self {
        Self {
            io: Box::new(stream),
            process: Some(process),
        }
    }

    /// The console stream.
    pub fn io_mut(&mut self) -> &mut Box<dyn ConsoleIo> {
        &mut self.io
    }

    /// Close the stream and reap the backing process.
    pub async fn stop(mut self) {
        let process = self.process.take();
        drop(self);
        if let Some(process) = process {
            let code = process.terminate(STOP_GRACE).await;
            tracing::debug!(pid = process.pid(), ?code, "Console process stopped");
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            tracing::debug!(pid = process.pid(), "Console handle dropped, killing process");
            process.kill();
        }
    }
}

/// Something that can open consoles of one [`DriverKind`].
pub trait Driver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Open a console to `node` on a `rows` x `cols` terminal.
    ///
    /// Runs on the blocking pool and may block; callers bound it with a timeout.
    fn start(&self, node: &Node, rows: u16, cols: u16) -> Result<DriverHandle, DriverError>;
}

/// Drivers that run a program on a PTY only differ in the command they build.
pub(crate) fn start_command(command: &CommandLine, rows: u16, cols: u16) -> Result<DriverHandle, DriverError> {
    let (stream, process) = pty::spawn(command, rows, cols).map_err(DriverError::Spawn)?;
    tracing::info!(pid = process.pid(), program = %command.argv[0], "Spawned console process");
    Ok(DriverHandle::from_pty(stream, process))
}

/// Driver implementations by kind.
#[derive(Clone, Default)]
pub struct Drivers {
    drivers: HashMap<DriverKind, Arc<dyn Driver>>,
}

impl Drivers {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `cmd`, `ssh` and `ipmitool` drivers.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut drivers = Self::new();
        drivers.register(Arc::new(CmdDriver));
        drivers.register(Arc::new(SshDriver));
        drivers.register(Arc::new(IpmiDriver));
        drivers
    }

    /// Register (or replace) the driver for its kind.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.kind(), driver);
    }

    /// Resolve the driver named by a node record.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Driver>, DriverError> {
        let kind: DriverKind = name.parse()?;
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or(DriverError::Unregistered(kind))
    }
}
