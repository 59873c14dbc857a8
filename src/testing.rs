//! Test support: an in-memory console driver and an in-process server.
//!
//! ```ignore
//! let harness = TestHarness::new().await?;
//! harness.create(Node::new("n1", "ssh")).await?;
//!
//! let mut console = harness.attach("n1").await?;
//! let mut remote = harness.driver().take_remote("n1").unwrap();
//! remote.write_all(b"login: ").await?;
//! console.wait_for_output(b"login:", Duration::from_secs(5)).await?;
//! ```

use crate::config::{Config, SessionConfig, StorageConfig, StorageKind};
use crate::driver::{Driver, DriverError, DriverHandle, DriverKind, Drivers};
use crate::manager::NodeManager;
use crate::node::Node;
use crate::protocol::{ATTACH_ENDED_MARKER, AttachEndReason, Request, Response};
use crate::{Client, ClientError, Server};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Buffer size of each in-memory console pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Errors from the test framework.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("timeout waiting for condition")]
    Timeout,

    #[error("request failed: {0}")]
    Request(#[from] ClientError),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: {0:?}")]
    Unexpected(Box<Response>),

    #[error("console stream closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
struct PipeState {
    spawns: HashMap<String, usize>,
    remotes: HashMap<String, DuplexStream>,
}

struct PipeInner {
    kind: DriverKind,
    delay: Duration,
    fail: bool,
    state: Mutex<PipeState>,
}

/// Driver whose consoles are in-memory pipes.
///
/// The far end of each console is kept so tests can play the node: write to
/// it to produce console output, read from it to see viewer input, drop it to
/// make the console exit.
#[derive(Clone)]
pub struct PipeDriver {
    inner: Arc<PipeInner>,
}

impl Default for PipeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeDriver {
    /// A driver registered as `ssh`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_kind(DriverKind::Ssh)
    }

    #[must_use]
    pub fn with_kind(kind: DriverKind) -> Self {
        Self {
            inner: Arc::new(PipeInner {
                kind,
                delay: Duration::ZERO,
                fail: false,
                state: Mutex::new(PipeState::default()),
            }),
        }
    }

    /// Block every start for `delay`, like a slow remote.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.rebuild(|inner| inner.delay = delay)
    }

    /// Fail every start.
    #[must_use]
    pub fn failing(self) -> Self {
        self.rebuild(|inner| inner.fail = true)
    }

    fn rebuild(self, f: impl FnOnce(&mut PipeInner)) -> Self {
        let mut inner = PipeInner {
            kind: self.inner.kind,
            delay: self.inner.delay,
            fail: self.inner.fail,
            state: Mutex::new(PipeState::default()),
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// How many times a console for `name` was started.
    #[must_use]
    pub fn spawn_count(&self, name: &str) -> usize {
        self.state().spawns.get(name).copied().unwrap_or(0)
    }

    /// The node side of the most recent console for `name`.
    #[must_use]
    pub fn take_remote(&self, name: &str) -> Option<DuplexStream> {
        self.state().remotes.remove(name)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PipeState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Driver for PipeDriver {
    fn kind(&self) -> DriverKind {
        self.inner.kind
    }

    fn start(&self, node: &Node, _rows: u16, _cols: u16) -> Result<DriverHandle, DriverError> {
        if !self.inner.delay.is_zero() {
            std::thread::sleep(self.inner.delay);
        }
        let mut state = self.state();
        *state.spawns.entry(node.name.clone()).or_default() += 1;
        if self.inner.fail {
            return Err(DriverError::Unavailable(format!("{} is unreachable", node.name)));
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        state.remotes.insert(node.name.clone(), remote);
        Ok(DriverHandle::new(local))
    }
}

/// A congo server running inside the test process.
///
/// Nodes with driver `ssh` get [`PipeDriver`] consoles; `cmd` nodes run real
/// commands on a PTY. The registry lives in memory and console logs go to a
/// scratch directory removed on drop.
pub struct TestHarness {
    dir: PathBuf,
    socket_path: PathBuf,
    driver: PipeDriver,
    manager: Arc<NodeManager>,
    shutdown_tx: broadcast::Sender<()>,
    server_handle: JoinHandle<()>,
}

impl TestHarness {
    /// Start a server with short idle and spawn timeouts.
    pub async fn new() -> Result<Self, TestError> {
        Self::with_session_config(SessionConfig {
            idle_grace_ms: 200,
            spawn_timeout_ms: 2_000,
            ..SessionConfig::default()
        })
        .await
    }

    pub async fn with_session_config(session: SessionConfig) -> Result<Self, TestError> {
        let dir = Self::unique_dir();
        std::fs::create_dir_all(&dir)?;
        let socket_path = dir.join("congo.sock");

        let config = Config {
            socket_path: Some(socket_path.clone()),
            log_dir: dir.join("logs"),
            storage: StorageConfig {
                kind: StorageKind::Memory,
                path: dir.join("nodes.json"),
            },
            session,
            ..Config::default()
        };

        let driver = PipeDriver::new();
        let mut drivers = Drivers::with_defaults();
        drivers.register(Arc::new(driver.clone()));

        let manager = Arc::new(NodeManager::from_config(&config, drivers));
        manager
            .start()
            .await
            .map_err(|e| TestError::Server(e.to_string()))?;

        let server = Server::new(socket_path.clone(), Arc::clone(&manager));
        let shutdown_tx = server.shutdown_handle();
        let server_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let harness = Self {
            dir,
            socket_path,
            driver,
            manager,
            shutdown_tx,
            server_handle,
        };
        harness.wait_for_socket(Duration::from_secs(5)).await?;
        Ok(harness)
    }

    /// Generate a unique scratch directory for this test.
    fn unique_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        std::env::temp_dir().join(format!("congo-test-{pid}-{id}"))
    }

    async fn wait_for_socket(&self, timeout: Duration) -> Result<(), TestError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(TestError::Timeout)
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Directory receiving `<node>.log` files.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.dir.join("logs")
    }

    /// The driver behind every `ssh` node.
    #[must_use]
    pub const fn driver(&self) -> &PipeDriver {
        &self.driver
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    /// A client on a fresh connection.
    #[must_use]
    pub fn client(&self) -> Client {
        Client::new(self.socket_path.clone())
    }

    /// Send one request on a fresh connection.
    pub async fn request(&self, request: Request) -> Result<Response, TestError> {
        Ok(self.client().request(request).await?)
    }

    /// Register a node, failing on any error response.
    pub async fn create(&self, node: Node) -> Result<Option<String>, TestError> {
        match self.request(Request::Create { node }).await? {
            Response::Created { warning, .. } => Ok(warning),
            other => Err(TestError::Unexpected(Box::new(other))),
        }
    }

    /// Attach to `name`'s console.
    pub async fn attach(&self, name: &str) -> Result<AttachedConsole, TestError> {
        match self.client().attach(name).await? {
            (Response::AttachStarted { writable, .. }, Some(stream)) => Ok(AttachedConsole {
                stream,
                writable,
                received: Vec::new(),
            }),
            (other, _) => Err(TestError::Unexpected(Box::new(other))),
        }
    }

    /// Poll `check` until it returns true.
    pub async fn wait_until<F, Fut>(&self, timeout: Duration, mut check: F) -> Result<(), TestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(TestError::Timeout)
    }

    /// Shut the server down through the protocol.
    pub async fn shutdown(self) {
        let _ = self.request(Request::Shutdown).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.manager.shutdown()).await;
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        self.server_handle.abort();
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// Client side of an attach connection.
pub struct AttachedConsole {
    stream: BufReader<UnixStream>,
    writable: bool,
    received: Vec<u8>,
}

impl AttachedConsole {
    /// Whether input from this viewer reaches the console.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Everything received so far.
    #[must_use]
    pub fn received(&self) -> &[u8] {
        &self.received
    }

    /// Type into the console.
    pub async fn send(&mut self, data: &[u8]) -> Result<(), TestError> {
        self.stream.get_mut().write_all(data).await?;
        Ok(())
    }

    /// Read until the received bytes contain `needle`.
    pub async fn wait_for_output(
        &mut self,
        needle: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TestError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        while !contains(&self.received, needle) {
            let n = tokio::time::timeout_at(deadline, self.stream.read(&mut buf))
                .await
                .map_err(|_| TestError::Timeout)??;
            if n == 0 {
                return Err(TestError::Closed);
            }
            self.received.extend_from_slice(&buf[..n]);
        }
        Ok(self.received.clone())
    }

    /// Detach and return the output received plus the server's end reason.
    pub async fn detach(mut self) -> Result<(Vec<u8>, AttachEndReason), TestError> {
        self.stream.get_mut().shutdown().await?;
        self.read_to_end(Duration::from_secs(5)).await
    }

    /// Wait for the server to end the stream on its own.
    pub async fn wait_ended(self, timeout: Duration) -> Result<(Vec<u8>, AttachEndReason), TestError> {
        self.read_to_end(timeout).await
    }

    async fn read_to_end(mut self, timeout: Duration) -> Result<(Vec<u8>, AttachEndReason), TestError> {
        tokio::time::timeout(timeout, self.stream.read_to_end(&mut self.received))
            .await
            .map_err(|_| TestError::Timeout)??;

        let Some(pos) = find(&self.received, ATTACH_ENDED_MARKER) else {
            return Err(TestError::Closed);
        };
        let trailer = self.received.split_off(pos);
        match serde_json::from_slice::<Response>(trailer.trim_ascii_end()) {
            Ok(Response::AttachEnded { reason }) => Ok((self.received, reason)),
            Ok(other) => Err(TestError::Unexpected(Box::new(other))),
            Err(e) => Err(TestError::Server(format!("malformed attach_ended: {e}"))),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || find(haystack, needle).is_some()
}
