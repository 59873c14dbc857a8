//! Interactive console mode.
//!
//! Bridges the user's terminal to a node console through the server. The
//! escape sequence `Ctrl+E c .` detaches; it is never forwarded.

use crate::protocol::{ATTACH_ENDED_MARKER, AttachEndReason, Response};
use std::io::IsTerminal;
use std::os::fd::{AsFd, OwnedFd};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Errors during console mode.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    #[error("connection lost")]
    ConnectionLost,
}

/// The detach sequence: Ctrl+E, `c`, `.`.
pub const ESCAPE_SEQUENCE: [u8; 3] = [0x05, b'c', b'.'];

/// Result of feeding input through an [`EscapeDetector`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    /// Bytes to send to the console.
    pub forward: Vec<u8>,
    /// The escape sequence completed; input after it is discarded.
    pub detach: bool,
}

/// Finds the escape sequence in keyboard input, across reads.
///
/// Bytes that start the sequence are held back until it either completes
/// (detach) or breaks off, in which case they are forwarded as typed.
#[derive(Debug, Default)]
pub struct EscapeDetector {
    matched: usize,
}

impl EscapeDetector {
    #[must_use]
    pub const fn new() -> Self {
        Self { matched: 0 }
    }

    pub fn feed(&mut self, input: &[u8]) -> Feed {
        let mut forward = Vec::with_capacity(input.len());
        for &byte in input {
            if byte == ESCAPE_SEQUENCE[self.matched] {
                self.matched += 1;
                if self.matched == ESCAPE_SEQUENCE.len() {
                    self.matched = 0;
                    return Feed {
                        forward,
                        detach: true,
                    };
                }
                continue;
            }

            forward.extend_from_slice(&ESCAPE_SEQUENCE[..self.matched]);
            if byte == ESCAPE_SEQUENCE[0] {
                self.matched = 1;
            } else {
                self.matched = 0;
                forward.push(byte);
            }
        }
        Feed {
            forward,
            detach: false,
        }
    }
}

/// Separates console output from the `attach_ended` line that closes the
/// stream.
#[derive(Debug, Default)]
struct OutputFilter {
    pending: Vec<u8>,
    trailer: Option<Vec<u8>>,
}

impl OutputFilter {
    /// Returns the bytes that are safe to print.
    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if let Some(trailer) = self.trailer.as_mut() {
            trailer.extend_from_slice(chunk);
            return Vec::new();
        }

        self.pending.extend_from_slice(chunk);
        if let Some(pos) = find(&self.pending, ATTACH_ENDED_MARKER) {
            self.trailer = Some(self.pending.split_off(pos));
            return std::mem::take(&mut self.pending);
        }

        // Hold back a tail that could be the start of the marker.
        let keep = (1..ATTACH_ENDED_MARKER.len())
            .rev()
            .find(|&n| self.pending.ends_with(&ATTACH_ENDED_MARKER[..n]))
            .unwrap_or(0);
        let ready = self.pending.len() - keep;
        self.pending.drain(..ready).collect()
    }

    /// Whatever is left once the server closes the stream.
    fn finish(self) -> (Vec<u8>, Option<AttachEndReason>) {
        let reason = self.trailer.and_then(|trailer| {
            let line = trailer.split(|&b| b == b'\n').next().unwrap_or_default();
            match serde_json::from_slice::<Response>(line) {
                Ok(Response::AttachEnded { reason }) => Some(reason),
                Ok(other) => {
                    warn!(?other, "Unexpected response at end of console stream");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Malformed end of console stream");
                    None
                }
            }
        });
        (self.pending, reason)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Saved terminal state for restoration.
struct TerminalState {
    original_termios: nix::sys::termios::Termios,
    stdin_fd: OwnedFd,
}

impl TerminalState {
    /// Switch stdin to raw mode. Returns `None` when stdin is not a terminal,
    /// e.g. when input is piped in.
    fn enter_raw_mode() -> Result<Option<Self>, AttachError> {
        use nix::sys::termios::{self, SetArg};

        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }
        let stdin_fd = stdin.as_fd().try_clone_to_owned().map_err(AttachError::Io)?;

        let original_termios = termios::tcgetattr(&stdin_fd).map_err(AttachError::GetTermios)?;
        let mut raw = original_termios.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin_fd, SetArg::TCSAFLUSH, &raw).map_err(AttachError::SetTermios)?;

        Ok(Some(Self {
            original_termios,
            stdin_fd,
        }))
    }
}

impl Drop for TerminalState {
    fn drop(&mut self) {
        use nix::sys::termios::{self, SetArg};
        if let Err(e) = termios::tcsetattr(&self.stdin_fd, SetArg::TCSAFLUSH, &self.original_termios)
        {
            eprintln!("Warning: failed to restore terminal: {e}");
        }
    }
}

/// Run console mode on a connection that already received `attach_started`.
///
/// Takes over stdin/stdout until the user detaches or the console ends.
pub async fn run_console(
    stream: BufReader<UnixStream>,
    node: &str,
) -> Result<AttachEndReason, AttachError> {
    let terminal = TerminalState::enter_raw_mode()?;
    info!(node, raw = terminal.is_some(), "Console attached");

    let result = run_io_bridge(stream).await;

    drop(terminal);
    info!(node, "Console detached");
    result
}

/// Run the bidirectional I/O bridge.
async fn run_io_bridge(stream: BufReader<UnixStream>) -> Result<AttachEndReason, AttachError> {
    let (mut server_rd, mut server_wr) = tokio::io::split(stream);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let mut detector = EscapeDetector::new();
    let mut filter = OutputFilter::default();
    let mut detaching = false;
    let mut input_buf = [0u8; 1024];
    let mut output_buf = [0u8; 4096];

    loop {
        tokio::select! {
            result = stdin.read(&mut input_buf), if !detaching => {
                let n = result.map_err(AttachError::Io)?;
                let feed = if n == 0 {
                    debug!("EOF on stdin, detaching");
                    Feed { forward: Vec::new(), detach: true }
                } else {
                    detector.feed(&input_buf[..n])
                };

                if !feed.forward.is_empty() {
                    server_wr.write_all(&feed.forward).await.map_err(AttachError::Io)?;
                }
                if feed.detach {
                    debug!("Detaching");
                    // Closing our write half tells the server we're gone.
                    server_wr.shutdown().await.map_err(AttachError::Io)?;
                    detaching = true;
                }
            }

            result = server_rd.read(&mut output_buf) => {
                let n = result.map_err(AttachError::Io)?;
                if n == 0 {
                    let (rest, reason) = std::mem::take(&mut filter).finish();
                    stdout.write_all(&rest).await.map_err(AttachError::Io)?;
                    stdout.flush().await.map_err(AttachError::Io)?;
                    return match reason {
                        Some(reason) => Ok(reason),
                        None if detaching => Ok(AttachEndReason::Detached),
                        None => Err(AttachError::ConnectionLost),
                    };
                }

                let ready = filter.feed(&output_buf[..n]);
                if !ready.is_empty() {
                    stdout.write_all(&ready).await.map_err(AttachError::Io)?;
                    stdout.flush().await.map_err(AttachError::Io)?;
                }
            }
        }
    }
}
