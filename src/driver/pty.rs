//! Console processes in pseudo-terminals.
//!
//! Every built-in driver ends up here: the driver decides which program to run
//! (`sh -c`, `ssh`, `ipmitool`), this module forks it onto a fresh PTY and
//! hands back the master side as an async byte stream.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execvpe, fork, setsid};
use std::ffi::{CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("command is empty")]
    EmptyCommand,

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] std::ffi::NulError),

    #[error("failed to register PTY with the runtime: {0}")]
    Register(#[source] io::Error),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),
}

/// A command line to run on a console PTY.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    /// Program and arguments.
    pub argv: Vec<String>,
    /// Extra environment variables (secrets are passed here, never in argv).
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// The child side of a console: its process ID.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
}

impl ChildProcess {
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // PIDs are always positive
    #[allow(clippy::missing_const_for_fn)] // as_raw() isn't const
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Send a signal to the child process.
    pub fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Check if the child process has exited without blocking.
    /// Returns `Some(exit_code)` if exited, None if still running.
    pub fn try_wait(&self) -> Result<Option<i32>, PtyError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
            _ => Ok(None),
        }
    }

    /// Terminate the child: SIGTERM, then SIGKILL once `grace` has passed.
    ///
    /// Returns the exit code, or `None` if the process was already reaped.
    pub async fn terminate(&self, grace: Duration) -> Option<i32> {
        const POLL: Duration = Duration::from_millis(50);

        match self.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(_) => return None,
        }
        if let Err(e) = self.signal(Signal::SIGTERM) {
            debug!(pid = self.pid(), %e, "SIGTERM failed");
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(POLL).await;
            match self.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) => {}
                Err(_) => return None,
            }
        }

        warn!(pid = self.pid(), "Console process ignored SIGTERM, killing");
        if let Err(e) = self.signal(Signal::SIGKILL) {
            debug!(pid = self.pid(), %e, "SIGKILL failed");
        }
        let pid = self.pid;
        tokio::task::spawn_blocking(move || match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            _ => None,
        })
        .await
        .ok()
        .flatten()
    }

    /// SIGKILL the child and reap it off the caller's thread.
    pub fn kill(self) {
        if let Err(e) = self.signal(Signal::SIGKILL) {
            debug!(pid = self.pid(), %e, "SIGKILL failed");
        }
        let pid = self.pid;
        let reap = move || {
            if let Err(e) = waitpid(pid, None) {
                debug!(pid = pid.as_raw(), %e, "Reaping killed console failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => drop(runtime.spawn_blocking(reap)),
            Err(_) => reap(),
        }
    }
}

/// Non-blocking PTY master registered with the tokio reactor.
pub struct PtyStream {
    fd: AsyncFd<OwnedFd>,
}

impl PtyStream {
    fn new(master: OwnedFd) -> Result<Self, PtyError> {
        // SAFETY: `master` is an open descriptor owned by the `AsyncFd` for its
        // whole lifetime, and `OwnedFd::as_raw_fd` always returns the same fd.
        unsafe { AsyncFd::register(master) }
            .map(|fd| Self { fd })
            .map_err(|e| PtyError::Register(e.into_parts().1))
    }
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| nix::unistd::read(inner.get_ref(), unfilled).map_err(io::Error::from)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // The slave side is gone: the console process exited.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Poll::Ready(Ok(())),
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| nix::unistd::write(inner.get_ref(), data).map_err(io::Error::from)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => {}
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Spawn a command in a new PTY of `rows` x `cols`.
///
/// Must be called from within a tokio runtime (the blocking pool counts).
pub fn spawn(command: &CommandLine, rows: u16, cols: u16) -> Result<(PtyStream, ChildProcess), PtyError> {
    if command.argv.is_empty() {
        return Err(PtyError::EmptyCommand);
    }

    // Prepare everything that allocates before forking.
    let prog = CString::new(command.argv[0].as_str()).map_err(PtyError::InvalidCommand)?;
    let args: Vec<CString> = command
        .argv
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()
        .map_err(PtyError::InvalidCommand)?;
    let env = environment(&command.env)?;

    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            drop(slave);

            let flags = fcntl(&master, FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
            let mut flags = OFlag::from_bits_retain(flags);
            flags.insert(OFlag::O_NONBLOCK);
            fcntl(&master, FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

            let child = ChildProcess { pid: child };
            match PtyStream::new(master) {
                Ok(stream) => Ok((stream, child)),
                Err(e) => {
                    child.kill();
                    Err(e)
                }
            }
        }
        ForkResult::Child => {
            drop(master);

            if setsid().is_err() {
                std::process::exit(1);
            }

            let slave_fd = slave.as_raw_fd();
            unsafe {
                if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) < 0 {
                    std::process::exit(1);
                }
                for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
                    if libc::dup2(slave_fd, target) < 0 {
                        std::process::exit(1);
                    }
                }
            }
            if slave_fd > 2 {
                drop(slave);
            }

            let _ = execvpe(&prog, &args, &env);
            // execvpe only returns on error
            std::process::exit(127);
        }
    }
}

/// The child's environment: ours, with `overrides` replacing or adding keys.
fn environment(overrides: &[(String, String)]) -> Result<Vec<CString>, PtyError> {
    let inherited = std::env::vars_os()
        .filter(|(key, _)| !overrides.iter().any(|(k, _)| key.as_os_str() == OsStr::new(k)))
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            entry
        });
    let set = overrides.iter().map(|(k, v)| format!("{k}={v}").into_bytes());
    inherited
        .chain(set)
        .map(CString::new)
        .collect::<Result<_, _>>()
        .map_err(PtyError::InvalidCommand)
}
