//! Node manager.
//!
//! The front door for every registry and console operation. Node records live
//! in [`Storage`]; live consoles in the [`SessionRegistry`]. Bulk operations
//! fan out over a bounded [`WorkerPool`] with a per-item timeout and always
//! complete with one outcome per name.

mod bulk;

pub use bulk::{BulkResult, Outcome};

use crate::config::Config;
use crate::driver::{DriverKind, Drivers};
use crate::error::ManagerError;
use crate::node::{Node, NodeName, NodeUpdate, validate_name};
use crate::pool::WorkerPool;
use crate::session::{CloseReason, SessionRegistry, SessionState, Viewer};
use crate::storage::{Backend, Change, Storage, StorageEvent};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Target of a bulk state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Open,
    Close,
}

impl FromStr for ConsoleState {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            other => Err(ManagerError::InvalidArgument(format!(
                "state must be \"open\" or \"close\", got {other:?}"
            ))),
        }
    }
}

/// The parts of the manager that individual work items need.
#[derive(Clone)]
struct Core {
    storage: Arc<Storage>,
    sessions: SessionRegistry,
}

/// Registry and console operations over storage and the session engine.
pub struct NodeManager {
    core: Core,
    pool: WorkerPool,
    item_timeout: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl NodeManager {
    /// Build a manager from its parts. Call [`NodeManager::start`] before use.
    #[must_use]
    pub fn new(storage: Storage, sessions: SessionRegistry, config: &Config) -> Self {
        Self {
            core: Core {
                storage: Arc::new(storage),
                sessions,
            },
            pool: WorkerPool::new(&config.pool),
            item_timeout: config.pool.item_timeout(),
            watcher: Mutex::new(None),
        }
    }

    /// Build a manager with the configured backend and the given drivers.
    #[must_use]
    pub fn from_config(config: &Config, drivers: Drivers) -> Self {
        let storage = Storage::new(Backend::from_config(&config.storage));
        let sessions = SessionRegistry::new(drivers, config.session.clone(), config.log_dir.clone());
        Self::new(storage, sessions, config)
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.core.storage
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.core.sessions
    }

    /// Import persisted nodes, follow storage changes, and open the consoles
    /// of nodes that are not on-demand.
    pub async fn start(&self) -> Result<(), ManagerError> {
        // Subscribe first so nothing between import and watch is missed.
        let events = self.core.storage.watch();
        let imported = self.core.storage.import_nodes().await?;
        info!(nodes = imported, async_backend = self.core.storage.is_async(), "Imported nodes");

        let watcher = tokio::spawn(self.core.clone().watch_storage(events));
        if let Some(old) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(watcher)
        {
            old.abort();
        }

        let eager: Vec<Node> = self
            .core
            .storage
            .get_nodes()
            .await
            .into_values()
            .filter(|node| !node.ondemand)
            .collect();
        let mut pending = Vec::with_capacity(eager.len());
        for node in eager {
            let core = self.core.clone();
            match self.pool.submit(async move { core.open_pinned(&node).await }).await {
                Ok(rx) => pending.push(rx),
                Err(e) => warn!(error = %e, "Could not schedule console open"),
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
        Ok(())
    }

    /// Stop following storage and close every console.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            watcher.abort();
        }
        self.core.sessions.close_all(&CloseReason::Shutdown).await;
        info!("Node manager stopped");
    }

    /// Every node, sorted by name.
    pub async fn list_nodes(&self) -> Vec<Node> {
        self.core.storage.get_nodes().await.into_values().collect()
    }

    /// Node name to `host` parameter (empty when unset).
    pub async fn list_nodes_with_host(&self) -> BTreeMap<String, String> {
        self.core.storage.list_nodes_with_host().await
    }

    pub async fn show_node(&self, name: &str) -> Result<Node, ManagerError> {
        self.core
            .storage
            .get_node(name)
            .await
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.core.storage.contains(name).await
    }

    /// State of `name`'s console, if one is live.
    pub async fn console_state(&self, name: &str) -> Option<SessionState> {
        self.core.sessions.get(name).await.map(|s| s.state())
    }

    /// Register a node. Returns a warning when an eager console open failed.
    pub async fn create_node(&self, node: Node) -> Result<Option<String>, ManagerError> {
        self.core.create(node).await
    }

    pub async fn create_nodes(&self, nodes: Vec<Node>) -> BulkResult {
        let items = nodes.into_iter().map(|node| (node.name.clone(), node)).collect();
        self.dispatch("create", items, |core, node| async move { core.create(node).await })
            .await
    }

    /// Replace a node's params and/or on-demand flag.
    pub async fn update_node(
        &self,
        name: &str,
        update: &NodeUpdate,
    ) -> Result<(Node, Option<String>), ManagerError> {
        let node = self.core.storage.update(name, update).await?;
        info!(node = %name, ondemand = node.ondemand, "Node updated");
        let warning = if node.ondemand {
            None
        } else {
            self.core.open_pinned(&node).await
        };
        Ok((node, warning))
    }

    /// Close the node's console, then remove it.
    pub async fn delete_node(&self, name: &str) -> Result<(), ManagerError> {
        self.core.delete(name).await.map(|_| ())
    }

    pub async fn delete_nodes(&self, nodes: Vec<NodeName>) -> BulkResult {
        let items = nodes.into_iter().map(|n| (n.name.clone(), n.name)).collect();
        self.dispatch("delete", items, |core, name| async move {
            core.delete(&name).await
        })
        .await
    }

    /// Open or close the consoles of `nodes`.
    ///
    /// `state` is checked before anything is dispatched.
    pub async fn set_console_state(
        &self,
        nodes: Vec<NodeName>,
        state: &str,
    ) -> Result<BulkResult, ManagerError> {
        let state: ConsoleState = state.parse()?;
        let items = nodes.into_iter().map(|n| (n.name.clone(), n.name)).collect();
        Ok(self
            .dispatch("set_state", items, move |core, name| async move {
                core.set_state(&name, state).await
            })
            .await)
    }

    /// Turn output recording on (a pinned console, watched or not) or off.
    pub async fn set_logging(&self, name: &str, on: bool) -> Result<(), ManagerError> {
        let node = self.show_node(name).await?;
        if on {
            self.core.sessions.open(&node, true).await?;
            info!(node = %name, "Logging enabled");
        } else {
            self.core.sessions.close(name, CloseReason::Requested).await;
            info!(node = %name, "Logging disabled");
        }
        Ok(())
    }

    /// Attach a viewer to the node's console, opening it for on-demand nodes.
    pub async fn attach(&self, name: &str) -> Result<Viewer, ManagerError> {
        let storage = Arc::clone(&self.core.storage);
        let viewer = self
            .core
            .sessions
            .attach(name, || async move { storage.get_node(name).await })
            .await?;
        Ok(viewer)
    }

    /// The last `bytes` of the node's console output.
    pub async fn tail(&self, name: &str, bytes: usize) -> Result<Vec<u8>, ManagerError> {
        if !self.exists(name).await {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        Ok(self.core.sessions.tail(name, bytes).await?)
    }

    /// Run one unit per item on the pool and collect name-keyed outcomes.
    ///
    /// Only the first occurrence of a name is dispatched; repeats are recorded
    /// as conflicts after it.
    async fn dispatch<T, F, Fut>(&self, op: &'static str, items: Vec<(String, T)>, run: F) -> BulkResult
    where
        T: Send + 'static,
        F: Fn(Core, T) -> Fut,
        Fut: Future<Output = Result<Option<String>, ManagerError>> + Send + 'static,
    {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        let mut pending = Vec::with_capacity(items.len());

        for (name, item) in items {
            if !seen.insert(name.clone()) {
                duplicates.push(name);
                continue;
            }
            let unit = run(self.core.clone(), item);
            let limit = self.item_timeout;
            // The timeout only ends the wait: the unit keeps running in its own
            // task, so a driver start or storage write is never cut in half.
            let bounded = async move {
                match timeout(limit, tokio::spawn(unit)).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => Err(ManagerError::Internal(format!("{op} failed: {e}"))),
                    Err(_) => {
                        warn!(op, "Bulk item timed out, letting it finish in the background");
                        Err(ManagerError::Timeout(format!(
                            "{op} did not finish within {limit:?}"
                        )))
                    }
                }
            };
            pending.push((name, self.pool.submit(bounded).await));
        }

        let mut result = BulkResult::new();
        for (name, submitted) in pending {
            let outcome = match submitted {
                Ok(rx) => rx.await.map_or_else(
                    |_| Outcome::failed(&ManagerError::Internal(format!("{op} aborted"))),
                    Outcome::from,
                ),
                Err(e) => Outcome::failed(&e.into()),
            };
            result.record(&name, outcome);
        }
        for name in duplicates {
            result.record(
                &name,
                Outcome::failed(&ManagerError::Conflict("duplicate name in request".into())),
            );
        }

        debug!(op, items = result.len(), failed = result.failed().count(), "Bulk operation finished");
        result
    }
}

impl Core {
    async fn create(&self, node: Node) -> Result<Option<String>, ManagerError> {
        validate_name(&node.name).map_err(ManagerError::InvalidArgument)?;
        if node.driver.is_empty() {
            return Err(ManagerError::InvalidArgument("driver is not defined".into()));
        }
        node.driver
            .parse::<DriverKind>()
            .map_err(|e| ManagerError::InvalidArgument(e.to_string()))?;

        self.storage.create(node.clone()).await?;
        info!(node = %node.name, driver = %node.driver, ondemand = node.ondemand, "Node created");

        if node.ondemand {
            Ok(None)
        } else {
            Ok(self.open_pinned(&node).await)
        }
    }

    async fn delete(&self, name: &str) -> Result<Option<String>, ManagerError> {
        if !self.storage.contains(name).await {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        let (closed, deleted) = self
            .sessions
            .close_then(name, CloseReason::NodeDeleted, || self.storage.delete(name))
            .await;
        deleted?;
        info!(node = %name, console_closed = closed, "Node deleted");
        Ok(None)
    }

    async fn set_state(&self, name: &str, state: ConsoleState) -> Result<Option<String>, ManagerError> {
        let node = self
            .storage
            .get_node(name)
            .await
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))?;
        match state {
            ConsoleState::Open => {
                self.sessions.open(&node, !node.ondemand).await?;
            }
            ConsoleState::Close => {
                self.sessions.close(name, CloseReason::Requested).await;
            }
        }
        Ok(None)
    }

    /// Open a console that ignores idle teardown. Failures come back as a
    /// warning rather than an error.
    async fn open_pinned(&self, node: &Node) -> Option<String> {
        match self.sessions.open(node, true).await {
            Ok(_) => None,
            Err(e) => {
                warn!(node = %node.name, error = %e, "Console not opened");
                Some(format!("console not opened: {e}"))
            }
        }
    }

    async fn watch_storage(self, mut events: broadcast::Receiver<StorageEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage events dropped, re-importing");
                    self.resync().await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Reload the index from the backend and bring consoles in line with it:
    /// close those of vanished nodes and open new or changed always-on ones.
    async fn resync(&self) {
        let before = self.storage.get_nodes().await;
        if let Err(e) = self.storage.import_nodes().await {
            warn!(error = %e, "Re-import failed");
            return;
        }
        let after = self.storage.get_nodes().await;

        for name in before.keys().filter(|name| !after.contains_key(*name)) {
            if self.sessions.close(name, CloseReason::NodeDeleted).await {
                info!(node = %name, "Closed console of node deleted by a peer");
            }
        }
        for node in after.values() {
            if !node.ondemand && before.get(&node.name) != Some(node) {
                self.open_pinned(node).await;
            }
        }
        debug!(before = before.len(), after = after.len(), "Resynced with storage");
    }

    async fn apply(&self, event: &StorageEvent) {
        match self.storage.apply_event(event).await {
            Change::Removed(name) => {
                if self.sessions.close(&name, CloseReason::NodeDeleted).await {
                    info!(node = %name, "Closed console of node deleted by a peer");
                }
            }
            Change::Upserted(node) if !node.ondemand => {
                self.open_pinned(&node).await;
            }
            Change::Upserted(_) | Change::Unchanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, SessionConfig};
    use crate::error::ErrorKind;
    use crate::storage::MemoryBackend;
    use crate::testing::PipeDriver;
    use tokio::io::AsyncWriteExt;

    struct Fixture {
        manager: NodeManager,
        driver: PipeDriver,
        _logs: tempfile::TempDir,
    }

    fn fixture_with(backend: MemoryBackend, driver: PipeDriver, config: Config) -> Fixture {
        let logs = tempfile::tempdir().unwrap();
        let mut drivers = Drivers::new();
        drivers.register(Arc::new(driver.clone()));
        let sessions = SessionRegistry::new(drivers, config.session.clone(), logs.path().to_path_buf());
        let storage = Storage::new(Backend::Memory(backend));
        Fixture {
            manager: NodeManager::new(storage, sessions, &config),
            driver,
            _logs: logs,
        }
    }

    fn test_config() -> Config {
        Config {
            session: SessionConfig {
                idle_grace_ms: 100,
                spawn_timeout_ms: 500,
                ..SessionConfig::default()
            },
            ..Config::default()
        }
    }

    async fn fixture() -> Fixture {
        let fixture = fixture_with(MemoryBackend::new(), PipeDriver::new(), test_config());
        fixture.manager.start().await.unwrap();
        fixture
    }

    fn ssh_node(name: &str) -> Node {
        Node::new(name, "ssh").with_param("host", "10.0.0.1")
    }

    #[tokio::test]
    async fn test_create_then_show() {
        let f = fixture().await;
        let node = ssh_node("n1").with_param("user", "root");
        assert_eq!(f.manager.create_node(node.clone()).await.unwrap(), None);
        assert_eq!(f.manager.show_node("n1").await.unwrap(), node);
        assert!(f.manager.exists("n1").await);
    }

    #[tokio::test]
    async fn test_delete_then_show_is_not_found() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("n1")).await.unwrap();
        f.manager.delete_node("n1").await.unwrap();

        let err = f.manager.show_node("n1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = f.manager.delete_node("n1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_conflict() {
        let f = fixture().await;
        let original = ssh_node("n1");
        f.manager.create_node(original.clone()).await.unwrap();

        let replacement = Node::new("n1", "ipmitool").with_param("host", "bmc");
        let err = f.manager.create_node(replacement).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(f.manager.show_node("n1").await.unwrap(), original);
    }

    #[tokio::test]
    async fn test_create_validates_input() {
        let f = fixture().await;
        let err = f.manager.create_node(Node::new("", "ssh")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = f.manager.create_node(Node::new("n1", "")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = f.manager.create_node(Node::new("n1", "telnet")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(f.manager.list_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let f = fixture().await;
        for name in ["c", "a", "b"] {
            f.manager.create_node(ssh_node(name)).await.unwrap();
        }
        let names: Vec<_> = f.manager.list_nodes().await.into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["a", "b", "c"]);

        let hosts = f.manager.list_nodes_with_host().await;
        assert_eq!(hosts["a"], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_bulk_create_mixed() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("taken")).await.unwrap();

        let result = f
            .manager
            .create_nodes(vec![
                ssh_node("a"),
                ssh_node("taken"),
                Node::new("b", "telnet"),
                ssh_node("c"),
            ])
            .await;

        assert_eq!(result.len(), 4);
        assert!(result.outcome("a").unwrap().is_success());
        assert!(result.outcome("c").unwrap().is_success());
        assert_eq!(result.outcome("taken").unwrap().error(), Some(ErrorKind::Conflict));
        assert_eq!(result.outcome("b").unwrap().error(), Some(ErrorKind::InvalidArgument));
        assert_eq!(f.manager.list_nodes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_bulk_duplicate_name() {
        let f = fixture().await;
        let result = f
            .manager
            .create_nodes(vec![ssh_node("a"), Node::new("a", "ipmitool")])
            .await;

        let outcomes = result.outcomes("a");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[1].error(), Some(ErrorKind::Conflict));
        assert_eq!(f.manager.show_node("a").await.unwrap().driver, "ssh");
    }

    #[tokio::test]
    async fn test_bulk_delete() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("a")).await.unwrap();

        let result = f
            .manager
            .delete_nodes(vec![NodeName::from("a"), NodeName::from("ghost")])
            .await;
        assert!(result.outcome("a").unwrap().is_success());
        assert_eq!(result.outcome("ghost").unwrap().error(), Some(ErrorKind::NotFound));
        assert!(!f.manager.exists("a").await);
    }

    #[tokio::test]
    async fn test_invalid_state_rejected_before_dispatch() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("a")).await.unwrap();

        let err = f
            .manager
            .set_console_state(vec![NodeName::from("a")], "reboot")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(f.driver.spawn_count("a"), 0);
    }

    #[tokio::test]
    async fn test_set_state_open_and_close() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("a")).await.unwrap();

        let result = f
            .manager
            .set_console_state(vec![NodeName::from("a"), NodeName::from("ghost")], "open")
            .await
            .unwrap();
        assert!(result.outcome("a").unwrap().is_success());
        assert_eq!(result.outcome("ghost").unwrap().error(), Some(ErrorKind::NotFound));
        assert_eq!(f.manager.console_state("a").await, Some(SessionState::Open));

        f.manager
            .set_console_state(vec![NodeName::from("a")], "close")
            .await
            .unwrap();
        assert_eq!(f.manager.console_state("a").await, None);
    }

    #[tokio::test]
    async fn test_non_ondemand_create_opens_console() {
        let f = fixture().await;
        let node = ssh_node("n1").with_ondemand(false);
        assert_eq!(f.manager.create_node(node).await.unwrap(), None);
        assert_eq!(f.driver.spawn_count("n1"), 1);

        let viewer = f.manager.attach("n1").await.unwrap();
        drop(viewer);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.manager.console_state("n1").await, Some(SessionState::Open));
    }

    #[tokio::test]
    async fn test_eager_open_failure_is_a_warning() {
        let f = fixture_with(MemoryBackend::new(), PipeDriver::new().failing(), test_config());
        f.manager.start().await.unwrap();

        let warning = f
            .manager
            .create_node(ssh_node("n1").with_ondemand(false))
            .await
            .unwrap();
        assert!(warning.unwrap().contains("console not opened"));
        assert!(f.manager.exists("n1").await);
    }

    #[tokio::test]
    async fn test_attach_non_ondemand_without_console() {
        let f = fixture_with(MemoryBackend::new(), PipeDriver::new().failing(), test_config());
        f.manager.start().await.unwrap();
        f.manager
            .create_node(ssh_node("n1").with_ondemand(false))
            .await
            .unwrap();

        let err = f.manager.attach("n1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotAvailable);
        let err = f.manager.attach("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_console_takeover_scenario() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("n1")).await.unwrap();

        let v1 = f.manager.attach("n1").await.unwrap();
        assert!(v1.is_writer());
        let v2 = f.manager.attach("n1").await.unwrap();
        assert!(v2.is_writer());
        assert!(!v1.is_writer());
        assert_eq!(f.driver.spawn_count("n1"), 1);

        drop(v2);
        assert!(v1.is_writer());
        let session = Arc::clone(v1.session());
        drop(v1);

        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert_eq!(f.manager.console_state("n1").await, None);
    }

    #[tokio::test]
    async fn test_delete_closes_console() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("n1")).await.unwrap();
        let mut viewer = f.manager.attach("n1").await.unwrap();

        f.manager.delete_node("n1").await.unwrap();
        assert_eq!(
            viewer.recv().await,
            crate::session::ViewerEvent::Ended(CloseReason::NodeDeleted)
        );
    }

    #[tokio::test]
    async fn test_logging_pins_console() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("n1")).await.unwrap();

        f.manager.set_logging("n1", true).await.unwrap();
        let mut remote = f.driver.take_remote("n1").unwrap();
        remote.write_all(b"kernel: ready\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(f.manager.tail("n1", 1024).await.unwrap(), b"kernel: ready\n");
        f.manager.set_logging("n1", false).await.unwrap();
        assert_eq!(f.manager.tail("n1", 1024).await.unwrap_err().kind(), ErrorKind::NotAvailable);
        assert_eq!(
            f.manager.tail("ghost", 1024).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_update_node() {
        let f = fixture().await;
        f.manager.create_node(ssh_node("n1")).await.unwrap();

        let update = NodeUpdate {
            params: None,
            ondemand: Some(false),
        };
        let (node, warning) = f.manager.update_node("n1", &update).await.unwrap();
        assert!(!node.ondemand);
        assert_eq!(warning, None);
        assert_eq!(f.manager.console_state("n1").await, Some(SessionState::Open));

        let err = f.manager.update_node("ghost", &update).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_bulk_item_timeout() {
        let mut config = test_config();
        config.pool.item_timeout_ms = 50;
        config.session.spawn_timeout_ms = 5_000;
        let driver = PipeDriver::new().with_delay(Duration::from_millis(500));
        let f = fixture_with(MemoryBackend::new(), driver, config);
        f.manager.start().await.unwrap();
        f.manager.create_node(ssh_node("slow")).await.unwrap();

        let result = f
            .manager
            .set_console_state(vec![NodeName::from("slow")], "open")
            .await
            .unwrap();
        assert_eq!(result.outcome("slow").unwrap().error(), Some(ErrorKind::Timeout));

        // The open was not cut short: the console still comes up, once.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.manager.console_state("slow").await != Some(SessionState::Open) {
            assert!(tokio::time::Instant::now() < deadline, "console never opened");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(f.driver.spawn_count("slow"), 1);
    }

    #[tokio::test]
    async fn test_reject_policy_reports_pool_full() {
        let mut config = test_config();
        config.pool.workers = 1;
        config.pool.queue_depth = 1;
        config.pool.overflow = OverflowPolicy::Reject;
        config.session.spawn_timeout_ms = 5_000;
        let driver = PipeDriver::new().with_delay(Duration::from_millis(300));
        let f = fixture_with(MemoryBackend::new(), driver, config);
        f.manager.start().await.unwrap();

        let names: Vec<_> = (0..5).map(|i| format!("n{i}")).collect();
        for name in &names {
            f.manager.create_node(ssh_node(name)).await.unwrap();
        }
        let result = f
            .manager
            .set_console_state(names.iter().map(|n| NodeName::from(n.as_str())).collect(), "open")
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        assert!(
            result
                .iter()
                .any(|(_, outcome)| outcome.error() == Some(ErrorKind::PoolFull))
        );
        assert!(result.outcome("n0").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_peer_changes_are_applied() {
        let backend = MemoryBackend::new();
        let a = fixture_with(backend.clone(), PipeDriver::new(), test_config());
        let b = fixture_with(backend, PipeDriver::new(), test_config());
        a.manager.start().await.unwrap();
        b.manager.start().await.unwrap();

        a.manager
            .create_node(ssh_node("shared").with_ondemand(false))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(b.manager.exists("shared").await);
        assert_eq!(b.driver.spawn_count("shared"), 1);

        a.manager.delete_node("shared").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!b.manager.exists("shared").await);
        assert_eq!(b.manager.console_state("shared").await, None);
    }

    #[tokio::test]
    async fn test_lagged_watch_resyncs_consoles() {
        let backend = MemoryBackend::new();
        let f = fixture_with(backend.clone(), PipeDriver::new(), test_config());
        let peer = Storage::new(Backend::Memory(backend));

        peer.create(ssh_node("doomed")).await.unwrap();
        peer.create(ssh_node("kept").with_ondemand(false)).await.unwrap();
        f.manager.storage().import_nodes().await.unwrap();
        let core = f.manager.core.clone();
        core.sessions.open(&ssh_node("doomed"), false).await.unwrap();
        core.sessions.open(&ssh_node("kept").with_ondemand(false), true).await.unwrap();

        // Subscribed but not yet draining: a busy peer overflows the channel.
        let events = core.storage.watch();
        peer.delete("doomed").await.unwrap();
        peer.create(ssh_node("eager").with_ondemand(false)).await.unwrap();
        for i in 0..crate::storage::EVENT_CAPACITY + 10 {
            peer.create(ssh_node(&format!("filler-{i}"))).await.unwrap();
        }

        let watcher = tokio::spawn(core.clone().watch_storage(events));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while f.manager.console_state("eager").await != Some(SessionState::Open) {
            assert!(tokio::time::Instant::now() < deadline, "eager node never opened");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        watcher.abort();

        assert!(!f.manager.exists("doomed").await);
        assert_eq!(f.manager.console_state("doomed").await, None);
        assert_eq!(f.manager.console_state("kept").await, Some(SessionState::Open));
        assert_eq!(f.driver.spawn_count("kept"), 1);
        assert_eq!(f.driver.spawn_count("filler-0"), 0);
    }

    #[tokio::test]
    async fn test_start_opens_persisted_non_ondemand_nodes() {
        let backend = MemoryBackend::new();
        let seed = Storage::new(Backend::Memory(backend.clone()));
        seed.create(ssh_node("eager").with_ondemand(false)).await.unwrap();
        seed.create(ssh_node("lazy")).await.unwrap();

        let f = fixture_with(backend, PipeDriver::new(), test_config());
        f.manager.start().await.unwrap();
        assert_eq!(f.driver.spawn_count("eager"), 1);
        assert_eq!(f.driver.spawn_count("lazy"), 0);

        f.manager.shutdown().await;
        assert_eq!(f.manager.console_state("eager").await, None);
    }
}
