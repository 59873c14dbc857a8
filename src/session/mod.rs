//! Console session engine.
//!
//! The [`SessionRegistry`] maps node names to at most one live
//! [`ConsoleSession`]. Each node gets a slot guarded by an async mutex that is
//! held across driver spawn, so concurrent attaches to a cold node start the
//! driver exactly once while other nodes proceed independently.

mod console;
mod log;

pub use console::{CloseReason, ConsoleSession, SessionState, Viewer, ViewerEvent};
pub use log::{LogFile, Ring};

use crate::config::SessionConfig;
use crate::driver::{DriverError, Drivers};
use crate::node::Node;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Errors from the session engine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("node not found: {0}")]
    NotFound(String),

    #[error("no console open for {0}")]
    NotAvailable(String),

    #[error("console for {0} is closing")]
    Closing(String),

    #[error("driver failed for {node}: {source}")]
    Driver {
        node: String,
        #[source]
        source: DriverError,
    },

    #[error("console for {node} did not open within {timeout:?}")]
    SpawnTimeout { node: String, timeout: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

type Slot = Arc<AsyncMutex<Option<Arc<ConsoleSession>>>>;

struct RegistryInner {
    slots: Mutex<HashMap<String, Slot>>,
    drivers: Drivers,
    config: SessionConfig,
    log_dir: PathBuf,
}

/// Node name to live console.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(drivers: Drivers, config: SessionConfig, log_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: Mutex::new(HashMap::new()),
                drivers,
                config,
                log_dir,
            }),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    fn existing_slot(&self, name: &str) -> Option<Slot> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn existing_slots(&self) -> Vec<(String, Slot)> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Drop `name`'s slot if it is empty and `slot` is the last reference
    /// outside the map.
    fn release(&self, name: &str, slot: Slot) {
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // New references are only handed out under this lock, so the count
        // cannot grow while we look.
        let unused = slots.get(name).is_some_and(|s| Arc::ptr_eq(s, &slot))
            && Arc::strong_count(&slot) == 2
            && slot.try_lock().is_ok_and(|guard| guard.is_none());
        if unused {
            slots.remove(name);
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The live session for `name`, if any.
    pub async fn get(&self, name: &str) -> Option<Arc<ConsoleSession>> {
        let slot = self.existing_slot(name)?;
        let live = slot.lock().await.as_ref().filter(|s| s.is_live()).cloned();
        self.release(name, slot);
        live
    }

    /// Open a console for `node`, or reuse the live one. With `pinned` set the
    /// session is exempt from idle teardown.
    pub async fn open(&self, node: &Node, pinned: bool) -> Result<Arc<ConsoleSession>, SessionError> {
        let slot = self.slot(&node.name);
        let result = self.open_in(&slot, node, pinned).await;
        self.release(&node.name, slot);
        result
    }

    async fn open_in(&self, slot: &Slot, node: &Node, pinned: bool) -> Result<Arc<ConsoleSession>, SessionError> {
        let mut guard = slot.lock().await;
        if let Some(session) = guard.as_ref().filter(|s| s.is_live()) {
            if pinned {
                session.pin();
            }
            return Ok(Arc::clone(session));
        }

        let session = self.spawn(node, pinned).await?;
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Attach a viewer to `name`'s console.
    ///
    /// `lookup` resolves the node record while the slot is locked, so a
    /// concurrent delete cannot slip in between the lookup and the spawn. A
    /// missing console is started for on-demand nodes only.
    pub async fn attach<F, Fut>(&self, name: &str, lookup: F) -> Result<Viewer, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Node>>,
    {
        let slot = self.slot(name);
        let result = self.attach_in(&slot, name, lookup).await;
        self.release(name, slot);
        result
    }

    async fn attach_in<F, Fut>(&self, slot: &Slot, name: &str, lookup: F) -> Result<Viewer, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<Node>>,
    {
        let mut guard = slot.lock().await;
        let node = lookup()
            .await
            .ok_or_else(|| SessionError::NotFound(name.to_string()))?;

        if let Some(session) = guard.as_ref().filter(|s| s.is_live()) {
            return session.attach();
        }
        if !node.ondemand {
            return Err(SessionError::NotAvailable(name.to_string()));
        }

        let session = self.spawn(&node, false).await?;
        *guard = Some(Arc::clone(&session));
        session.attach()
    }

    /// Close `name`'s console. Returns whether one was live.
    pub async fn close(&self, name: &str, reason: CloseReason) -> bool {
        self.close_then(name, reason, || async {}).await.0
    }

    /// Close `name`'s console, then run `then` before anyone can open it again.
    pub async fn close_then<F, Fut, T>(&self, name: &str, reason: CloseReason, then: F) -> (bool, T)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;
        let closed = match guard.take() {
            Some(session) if session.is_live() => {
                session.shutdown(reason).await;
                true
            }
            _ => false,
        };
        let out = then().await;
        drop(guard);
        self.release(name, slot);
        (closed, out)
    }

    /// Close every live console.
    pub async fn close_all(&self, reason: &CloseReason) {
        for (name, slot) in self.existing_slots() {
            let mut guard = slot.lock().await;
            if let Some(session) = guard.take() {
                session.shutdown(reason.clone()).await;
            }
            drop(guard);
            self.release(&name, slot);
        }
    }

    /// The last `n` bytes of `name`'s console output.
    pub async fn tail(&self, name: &str, n: usize) -> Result<Vec<u8>, SessionError> {
        self.get(name)
            .await
            .map(|session| session.tail(n))
            .ok_or_else(|| SessionError::NotAvailable(name.to_string()))
    }

    async fn spawn(&self, node: &Node, pinned: bool) -> Result<Arc<ConsoleSession>, SessionError> {
        let config = &self.inner.config;
        let driver = self
            .inner
            .drivers
            .resolve(&node.driver)
            .map_err(|source| SessionError::Driver {
                node: node.name.clone(),
                source,
            })?;

        let (session, input) = ConsoleSession::new(&node.name, node.ondemand, pinned, config);
        debug!(node = %node.name, driver = %node.driver, "Opening console");

        let mut start = {
            let node = node.clone();
            let (rows, cols) = (config.rows, config.cols);
            tokio::task::spawn_blocking(move || driver.start(&node, rows, cols))
        };

        let handle = match timeout(config.spawn_timeout(), &mut start).await {
            Ok(Ok(Ok(handle))) => handle,
            Ok(Ok(Err(source))) => {
                session.abandon(CloseReason::SpawnFailed {
                    message: source.to_string(),
                });
                return Err(SessionError::Driver {
                    node: node.name.clone(),
                    source,
                });
            }
            Ok(Err(e)) => {
                session.abandon(CloseReason::SpawnFailed {
                    message: e.to_string(),
                });
                return Err(SessionError::Internal(format!("driver task failed: {e}")));
            }
            Err(_) => {
                session.abandon(CloseReason::SpawnFailed {
                    message: "timed out".to_string(),
                });
                // The driver may still come up; make sure it doesn't leak.
                let name = node.name.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(handle)) = start.await {
                        warn!(node = %name, "Console opened after timeout, stopping it");
                        handle.stop().await;
                    }
                });
                return Err(SessionError::SpawnTimeout {
                    node: node.name.clone(),
                    timeout: config.spawn_timeout(),
                });
            }
        };

        let log = match LogFile::open(&self.inner.log_dir, &node.name).await {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(node = %node.name, error = %e, "Console log unavailable");
                None
            }
        };

        let pump = session.start(handle, input, log);
        let registry = self.clone();
        let reaped = Arc::clone(&session);
        tokio::spawn(async move {
            let _ = pump.await;
            registry.remove_if_same(&reaped).await;
        });

        if node.ondemand {
            tokio::spawn(self.clone().watch_idle(Arc::clone(&session)));
        }

        info!(node = %node.name, driver = %node.driver, pinned, "Console opened");
        Ok(session)
    }

    async fn remove_if_same(&self, session: &Arc<ConsoleSession>) {
        let Some(slot) = self.existing_slot(session.name()) else {
            return;
        };
        let mut guard = slot.lock().await;
        if guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *guard = None;
        }
        drop(guard);
        self.release(session.name(), slot);
    }

    /// Close an on-demand session once its viewers have all gone and the grace
    /// period passes without a new attach.
    async fn watch_idle(self, session: Arc<ConsoleSession>) {
        let grace = self.inner.config.idle_grace();
        let mut viewers = session.watch_viewers();

        // Nothing to tear down until someone has watched.
        tokio::select! {
            attached = wait_viewers(&mut viewers, true) => if !attached { return },
            () = session.closed() => return,
        }

        loop {
            tokio::select! {
                emptied = wait_viewers(&mut viewers, false) => if !emptied { return },
                () = session.closed() => return,
            }

            tokio::select! {
                () = tokio::time::sleep(grace) => {}
                attached = wait_viewers(&mut viewers, true) => {
                    if !attached {
                        return;
                    }
                    continue;
                }
                () = session.closed() => return,
            }

            if self.close_if_idle(&session).await {
                return;
            }
        }
    }

    async fn close_if_idle(&self, session: &Arc<ConsoleSession>) -> bool {
        let Some(slot) = self.existing_slot(session.name()) else {
            return true;
        };
        let mut guard = slot.lock().await;
        let done = if !guard.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            true
        } else if session.viewer_count() > 0 || session.is_pinned() {
            false
        } else {
            info!(node = %session.name(), "Closing idle console");
            session.shutdown(CloseReason::Idle).await;
            *guard = None;
            true
        };
        drop(guard);
        self.release(session.name(), slot);
        done
    }
}

/// Wait until the session has viewers (`attached`) or has none. False once
/// the session is gone.
async fn wait_viewers(viewers: &mut watch::Receiver<usize>, attached: bool) -> bool {
    viewers.wait_for(|n| (*n > 0) == attached).await.is_ok()
}
