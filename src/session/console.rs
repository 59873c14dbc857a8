//! A single live console and the viewers attached to it.

use super::SessionError;
use super::log::{LogFile, Ring};
use crate::config::SessionConfig;
use crate::driver::DriverHandle;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the driver read buffer.
const READ_BUF_SIZE: usize = 8192;

/// Viewer input queued ahead of the driver.
const INPUT_QUEUE: usize = 64;

/// Lifecycle of a console. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Why a console ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum CloseReason {
    /// Closed through the management API.
    Requested,
    /// Nobody watched it for the idle grace period.
    Idle,
    /// Its node was deleted.
    NodeDeleted,
    /// The driver's stream hit end of file.
    DriverExited,
    /// Reading from or writing to the driver failed.
    DriverError { message: String },
    /// The spawn never produced a console.
    SpawnFailed { message: String },
    /// The server is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed on request"),
            Self::Idle => f.write_str("closed after idling without viewers"),
            Self::NodeDeleted => f.write_str("node deleted"),
            Self::DriverExited => f.write_str("console process exited"),
            Self::DriverError { message } => write!(f, "console I/O failed: {message}"),
            Self::SpawnFailed { message } => write!(f, "console failed to open: {message}"),
            Self::Shutdown => f.write_str("server shutting down"),
        }
    }
}

/// A chunk of output tagged with its position in the console's output stream.
#[derive(Debug, Clone)]
struct Chunk {
    offset: u64,
    data: Bytes,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Output retained by the session: the `tail` ring plus the running offset.
struct History {
    ring: Ring,
    total: u64,
}

/// Attached viewers, oldest first. The last one holds the write token.
#[derive(Default)]
struct ViewerSet {
    next_id: u64,
    attached: Vec<u64>,
}

/// One live byte stream to a node's console, fanned out to any number of
/// viewers.
///
/// The driver handle is owned by the session's I/O task; everything else is
/// shared through this struct.
pub struct ConsoleSession {
    name: String,
    ondemand: bool,
    pinned: AtomicBool,
    state: watch::Sender<SessionState>,
    output: broadcast::Sender<Chunk>,
    input: mpsc::Sender<Bytes>,
    viewers: Mutex<ViewerSet>,
    viewer_count: watch::Sender<usize>,
    history: Mutex<History>,
    shutdown: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConsoleSession {
    /// A session in the `opening` state, plus the receiving end of its input
    /// queue for [`ConsoleSession::start`].
    pub(super) fn new(
        name: &str,
        ondemand: bool,
        pinned: bool,
        config: &SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (input, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (output, _) = broadcast::channel(config.fanout_capacity.max(1));
        let session = Arc::new(Self {
            name: name.to_string(),
            ondemand,
            pinned: AtomicBool::new(pinned),
            state: watch::Sender::new(SessionState::Opening),
            output,
            input,
            viewers: Mutex::new(ViewerSet::default()),
            viewer_count: watch::Sender::new(0),
            history: Mutex::new(History {
                ring: Ring::new(config.ring_size),
                total: 0,
            }),
            shutdown: CancellationToken::new(),
            reason: Mutex::new(None),
        });
        (session, input_rx)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn ondemand(&self) -> bool {
        self.ondemand
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session still accepts viewers and input.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() <= SessionState::Open
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    /// Exempt the session from idle teardown.
    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        *self.viewer_count.borrow()
    }

    pub(super) fn watch_viewers(&self) -> watch::Receiver<usize> {
        self.viewer_count.subscribe()
    }

    /// The reason recorded when the session began closing.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.reason).clone()
    }

    /// The last `n` bytes the console printed.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<u8> {
        lock(&self.history).ring.tail(n)
    }

    /// Resolves once the session has started closing.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s >= SessionState::Closing).await;
    }

    fn advance(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    fn record_reason(&self, reason: CloseReason) {
        lock(&self.reason).get_or_insert(reason);
    }

    /// Mark a session whose driver never started as closed.
    pub(super) fn abandon(&self, reason: CloseReason) {
        self.record_reason(reason);
        self.advance(SessionState::Closed);
    }

    /// Hand the driver to a new I/O task and mark the session open.
    pub(super) fn start(
        self: &Arc<Self>,
        handle: DriverHandle,
        input: mpsc::Receiver<Bytes>,
        log: Option<LogFile>,
    ) -> JoinHandle<()> {
        self.advance(SessionState::Open);
        tokio::spawn(Arc::clone(self).pump(handle, input, log))
    }

    /// Close the session and wait for its I/O task to release the driver.
    pub async fn shutdown(&self, reason: CloseReason) {
        self.record_reason(reason);
        self.shutdown.cancel();
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Admit a new viewer. It becomes the writer.
    pub fn attach(self: &Arc<Self>) -> Result<Viewer, SessionError> {
        if !self.is_live() {
            return Err(SessionError::Closing(self.name.clone()));
        }

        let (output, next_offset) = {
            let history = lock(&self.history);
            (self.output.subscribe(), history.total)
        };
        let (id, count) = {
            let mut viewers = lock(&self.viewers);
            viewers.next_id += 1;
            let id = viewers.next_id;
            viewers.attached.push(id);
            (id, viewers.attached.len())
        };
        self.viewer_count.send_replace(count);
        debug!(node = %self.name, viewer = id, viewers = count, "Viewer attached");

        Ok(Viewer {
            id,
            session: Arc::clone(self),
            output,
            state: self.state.subscribe(),
            next_offset,
            pending: None,
        })
    }

    fn detach(&self, id: u64) {
        let count = {
            let mut viewers = lock(&self.viewers);
            viewers.attached.retain(|v| *v != id);
            viewers.attached.len()
        };
        self.viewer_count.send_replace(count);
        debug!(node = %self.name, viewer = id, viewers = count, "Viewer detached");
    }

    fn writer(&self) -> Option<u64> {
        lock(&self.viewers).attached.last().copied()
    }

    fn publish(&self, data: Bytes) {
        let mut history = lock(&self.history);
        let chunk = Chunk {
            offset: history.total,
            data: data.clone(),
        };
        history.total = chunk.end();
        history.ring.append(data);
        // No receivers is fine: output is still logged and kept for tail.
        let _ = self.output.send(chunk);
    }

    async fn pump(
        self: Arc<Self>,
        mut handle: DriverHandle,
        mut input: mpsc::Receiver<Bytes>,
        mut log: Option<LogFile>,
    ) {
        info!(node = %self.name, "Console open");

        let ended = {
            let (mut reader, mut writer) = tokio::io::split(handle.io_mut());
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => break CloseReason::Requested,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => break CloseReason::DriverExited,
                        Ok(n) => {
                            let data = Bytes::copy_from_slice(&buf[..n]);
                            if let Some(log) = log.as_mut() {
                                log.write(&data).await;
                            }
                            self.publish(data);
                        }
                        Err(e) => break CloseReason::DriverError { message: e.to_string() },
                    },
                    Some(data) = input.recv() => {
                        let written = match writer.write_all(&data).await {
                            Ok(()) => writer.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            break CloseReason::DriverError { message: e.to_string() };
                        }
                    }
                }
            }
        };

        self.record_reason(ended);
        self.advance(SessionState::Closing);
        if let Some(log) = log.as_mut() {
            log.flush().await;
        }
        handle.stop().await;
        self.advance(SessionState::Closed);

        match self.close_reason() {
            Some(CloseReason::DriverError { message }) => {
                warn!(node = %self.name, error = %message, "Console closed after driver failure");
            }
            reason => {
                info!(node = %self.name, ?reason, "Console closed");
            }
        }
    }
}

/// What a viewer sees next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Console output, in driver order.
    Output(Bytes),
    /// The viewer fell behind and this many bytes were dropped for it.
    Lagged(u64),
    /// The console is gone; no more events follow.
    Ended(CloseReason),
}

/// A client's attachment to a console. Dropping it detaches.
pub struct Viewer {
    id: u64,
    session: Arc<ConsoleSession>,
    output: broadcast::Receiver<Chunk>,
    state: watch::Receiver<SessionState>,
    next_offset: u64,
    pending: Option<Bytes>,
}

impl fmt::Debug for Viewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Viewer")
            .field("id", &self.id)
            .field("node", &self.session.name())
            .finish_non_exhaustive()
    }
}

impl Viewer {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn session(&self) -> &Arc<ConsoleSession> {
        &self.session
    }

    /// Whether this viewer currently holds the write token.
    #[must_use]
    pub fn is_writer(&self) -> bool {
        self.session.writer() == Some(self.id)
    }

    /// Forward input to the driver. Returns `false` (and drops the input) when
    /// another viewer holds the write token.
    pub async fn send(&self, data: Bytes) -> Result<bool, SessionError> {
        if !self.is_writer() {
            return Ok(false);
        }
        self.session
            .input
            .send(data)
            .await
            .map_err(|_| SessionError::Closing(self.session.name.clone()))?;
        Ok(true)
    }

    /// Wait for the next event. Buffered output is always delivered before
    /// [`ViewerEvent::Ended`].
    pub async fn recv(&mut self) -> ViewerEvent {
        if let Some(data) = self.pending.take() {
            return ViewerEvent::Output(data);
        }

        loop {
            tokio::select! {
                biased;
                received = self.output.recv() => match received {
                    Ok(chunk) => {
                        if let Some(event) = self.accept(chunk) {
                            return event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return self.ended(),
                },
                changed = self.state.changed() => {
                    if changed.is_ok() && *self.state.borrow_and_update() < SessionState::Closing {
                        continue;
                    }
                    // Drain what the driver printed before it closed.
                    loop {
                        match self.output.try_recv() {
                            Ok(chunk) => {
                                if let Some(event) = self.accept(chunk) {
                                    return event;
                                }
                            }
                            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                            Err(_) => return self.ended(),
                        }
                    }
                }
            }
        }
    }

    /// Turn a received chunk into an event, accounting for dropped output.
    fn accept(&mut self, chunk: Chunk) -> Option<ViewerEvent> {
        if chunk.end() <= self.next_offset {
            return None;
        }
        let skipped = chunk.offset.saturating_sub(self.next_offset);
        self.next_offset = chunk.end();
        if skipped > 0 {
            self.pending = Some(chunk.data);
            return Some(ViewerEvent::Lagged(skipped));
        }
        Some(ViewerEvent::Output(chunk.data))
    }

    fn ended(&self) -> ViewerEvent {
        ViewerEvent::Ended(
            self.session
                .close_reason()
                .unwrap_or(CloseReason::Requested),
        )
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.session.detach(self.id);
    }
}
