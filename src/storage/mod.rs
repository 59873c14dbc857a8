//! Node registry persistence.
//!
//! `Storage` keeps an in-memory index of every node in front of a pluggable
//! [`Backend`]. Reads are served from the index; writes go to the backend
//! first and only touch the index once the backend accepted them, so a failed
//! write leaves both sides unchanged.
//!
//! Every backend publishes its mutations on a broadcast channel. Peers sharing
//! a backend subscribe with [`Storage::watch`] and fold the events back into
//! their own index with [`Storage::apply_event`].

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use crate::config::{StorageConfig, StorageKind};
use crate::node::{Node, NodeUpdate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

/// Capacity of each backend's event channel.
pub(crate) const EVENT_CAPACITY: usize = 1024;

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode registry: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("corrupt registry file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind of mutation carried by a [`StorageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
}

/// A registry mutation published by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub operation: Operation,
    pub node: Node,
}

/// What [`Storage::apply_event`] did to the local index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// The node was inserted or replaced.
    Upserted(Node),
    /// The node was dropped from the index.
    Removed(String),
    /// The index already matched the backend.
    Unchanged,
}

/// The closed set of storage backends.
pub enum Backend {
    File(FileBackend),
    Memory(MemoryBackend),
}

impl Backend {
    /// Build the backend named by the configuration.
    #[must_use]
    pub fn from_config(config: &StorageConfig) -> Self {
        match config.kind {
            StorageKind::File => Self::File(FileBackend::new(config.path.clone())),
            StorageKind::Memory => Self::Memory(MemoryBackend::new()),
        }
    }

    async fn load(&self) -> Result<Vec<Node>, StorageError> {
        match self {
            Self::File(backend) => backend.load().await,
            Self::Memory(backend) => Ok(backend.load()),
        }
    }

    async fn get(&self, name: &str) -> Option<Node> {
        match self {
            Self::File(backend) => backend.get(name).await,
            Self::Memory(backend) => backend.get(name),
        }
    }

    async fn create(&self, node: &Node) -> Result<(), StorageError> {
        match self {
            Self::File(backend) => backend.create(node).await,
            Self::Memory(backend) => backend.create(node),
        }
    }

    async fn update(&self, node: &Node) -> Result<(), StorageError> {
        match self {
            Self::File(backend) => backend.update(node).await,
            Self::Memory(backend) => backend.update(node),
        }
    }

    async fn delete(&self, name: &str) -> Result<Node, StorageError> {
        match self {
            Self::File(backend) => backend.delete(name).await,
            Self::Memory(backend) => backend.delete(name),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        match self {
            Self::File(backend) => backend.subscribe(),
            Self::Memory(backend) => backend.subscribe(),
        }
    }

    const fn is_async(&self) -> bool {
        match self {
            Self::File(_) => false,
            Self::Memory(_) => true,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Memory(_) => "memory",
        }
    }
}

/// In-memory node index over a durable backend.
pub struct Storage {
    backend: Backend,
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl Storage {
    /// Wrap a backend. The index starts empty until [`Storage::import_nodes`].
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replace the index with everything the backend holds.
    pub async fn import_nodes(&self) -> Result<usize, StorageError> {
        let loaded = self.backend.load().await?;
        let mut nodes = self.nodes.write().await;
        *nodes = loaded
            .into_iter()
            .map(|node| (node.name.clone(), node))
            .collect();
        debug!(backend = self.backend.name(), count = nodes.len(), "Imported nodes");
        Ok(nodes.len())
    }

    /// Snapshot of the index.
    pub async fn get_nodes(&self) -> BTreeMap<String, Node> {
        self.nodes.read().await.clone()
    }

    pub async fn get_node(&self, name: &str) -> Option<Node> {
        self.nodes.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.nodes.read().await.contains_key(name)
    }

    /// Persist a new node.
    pub async fn create(&self, node: Node) -> Result<(), StorageError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.name) {
            return Err(StorageError::AlreadyExists(node.name));
        }
        self.backend.create(&node).await?;
        nodes.insert(node.name.clone(), node);
        Ok(())
    }

    /// Apply `update` to an existing node and return the new record.
    pub async fn update(&self, name: &str, update: &NodeUpdate) -> Result<Node, StorageError> {
        let mut nodes = self.nodes.write().await;
        let mut node = nodes
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        update.apply(&mut node);
        self.backend.update(&node).await?;
        nodes.insert(node.name.clone(), node.clone());
        Ok(node)
    }

    /// Remove a node and return its last record.
    pub async fn delete(&self, name: &str) -> Result<Node, StorageError> {
        let mut nodes = self.nodes.write().await;
        if !nodes.contains_key(name) {
            return Err(StorageError::NotFound(name.to_string()));
        }
        let node = self.backend.delete(name).await?;
        nodes.remove(name);
        Ok(node)
    }

    /// Subscribe to every mutation of the backend, local or remote.
    pub fn watch(&self) -> broadcast::Receiver<StorageEvent> {
        self.backend.subscribe()
    }

    /// Fold a watch event into the index.
    ///
    /// Events may arrive late, twice, or out of order, so the event only names
    /// the node: the index entry is reconciled against the backend's current
    /// record for it.
    pub async fn apply_event(&self, event: &StorageEvent) -> Change {
        let name = &event.node.name;
        let mut nodes = self.nodes.write().await;
        match self.backend.get(name).await {
            Some(current) if nodes.get(name) == Some(&current) => Change::Unchanged,
            Some(current) => {
                nodes.insert(name.clone(), current.clone());
                Change::Upserted(current)
            }
            None if nodes.remove(name).is_some() => Change::Removed(name.clone()),
            None => Change::Unchanged,
        }
    }

    /// Whether writes may return before they are durable.
    #[must_use]
    pub const fn is_async(&self) -> bool {
        self.backend.is_async()
    }

    /// Map of node name to its `host` parameter (empty when unset).
    pub async fn list_nodes_with_host(&self) -> BTreeMap<String, String> {
        self.nodes
            .read()
            .await
            .values()
            .map(|node| (node.name.clone(), node.host().unwrap_or_default().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn memory_storage() -> Storage {
        Storage::new(Backend::Memory(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let storage = memory_storage();
        let node = Node::new("n1", "ssh").with_param("host", "10.0.0.1");
        storage.create(node.clone()).await.unwrap();
        assert_eq!(storage.get_node("n1").await, Some(node));
        assert!(storage.contains("n1").await);
    }

    #[tokio::test]
    async fn test_duplicate_create_keeps_original() {
        let storage = memory_storage();
        storage
            .create(Node::new("n1", "ssh").with_param("host", "a"))
            .await
            .unwrap();
        let result = storage
            .create(Node::new("n1", "cmd").with_param("host", "b"))
            .await;
        assert!(matches!(result, Err(StorageError::AlreadyExists(name)) if name == "n1"));
        let node = storage.get_node("n1").await.unwrap();
        assert_eq!(node.driver, "ssh");
        assert_eq!(node.host(), Some("a"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let storage = memory_storage();
        storage.create(Node::new("n1", "ssh")).await.unwrap();
        let update = NodeUpdate {
            params: Some(BTreeMap::from([("host".into(), "h".into())])),
            ondemand: Some(false),
        };
        let node = storage.update("n1", &update).await.unwrap();
        assert_eq!(node.host(), Some("h"));
        assert!(!node.ondemand);

        storage.delete("n1").await.unwrap();
        assert!(storage.get_node("n1").await.is_none());
        assert!(matches!(
            storage.delete("n1").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.update("n1", &update).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_nodes_with_host() {
        let storage = memory_storage();
        storage
            .create(Node::new("a", "ssh").with_param("host", "10.0.0.1"))
            .await
            .unwrap();
        storage.create(Node::new("b", "cmd")).await.unwrap();
        let hosts = storage.list_nodes_with_host().await;
        assert_eq!(hosts.get("a").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(hosts.get("b").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn test_peer_mutations_reach_watchers() {
        let shared = MemoryBackend::new();
        let local = Storage::new(Backend::Memory(shared.clone()));
        let peer = Storage::new(Backend::Memory(shared));
        let mut events = local.watch();

        peer.create(Node::new("n1", "ssh")).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, Operation::Created);
        assert!(local.get_node("n1").await.is_none());

        assert_eq!(
            local.apply_event(&event).await,
            Change::Upserted(Node::new("n1", "ssh"))
        );
        assert!(local.get_node("n1").await.is_some());

        // Redelivery is a no-op.
        assert_eq!(local.apply_event(&event).await, Change::Unchanged);

        peer.delete("n1").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, Operation::Deleted);
        assert_eq!(
            local.apply_event(&event).await,
            Change::Removed("n1".into())
        );
    }

    #[tokio::test]
    async fn test_stale_create_event_does_not_resurrect() {
        let shared = MemoryBackend::new();
        let local = Storage::new(Backend::Memory(shared.clone()));
        let peer = Storage::new(Backend::Memory(shared));
        let mut events = local.watch();

        peer.create(Node::new("n1", "ssh")).await.unwrap();
        peer.delete("n1").await.unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(local.apply_event(&created).await, Change::Unchanged);
        assert!(local.get_node("n1").await.is_none());
    }

    #[tokio::test]
    async fn test_memory_backend_is_async() {
        assert!(memory_storage().is_async());
    }
}
