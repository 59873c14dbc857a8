//! Single-file JSON backend.
//!
//! The whole registry lives in one `{"nodes": {...}}` document that is
//! rewritten through a temporary file and a rename on every mutation, so a
//! crash leaves either the old or the new registry on disk. A write returns
//! only after the rename, which makes this backend synchronous.

use super::{EVENT_CAPACITY, Operation, StorageError, StorageEvent};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    nodes: BTreeMap<String, Node>,
}

pub struct FileBackend {
    path: PathBuf,
    records: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<StorageEvent>,
}

impl FileBackend {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            path,
            records: Mutex::new(BTreeMap::new()),
            events,
        }
    }

    pub(super) async fn load(&self) -> Result<Vec<Node>, StorageError> {
        let document = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<Document>(&bytes).map_err(|source| {
                StorageError::Decode {
                    path: self.path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No registry file yet, starting empty");
                Document::default()
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let nodes: Vec<Node> = document.nodes.values().cloned().collect();
        *self.records.lock().await = document.nodes;
        Ok(nodes)
    }

    pub(super) async fn get(&self, name: &str) -> Option<Node> {
        self.records.lock().await.get(name).cloned()
    }

    pub(super) async fn create(&self, node: &Node) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&node.name) {
            return Err(StorageError::AlreadyExists(node.name.clone()));
        }
        records.insert(node.name.clone(), node.clone());
        if let Err(e) = self.write(&records).await {
            records.remove(&node.name);
            return Err(e);
        }
        drop(records);
        self.publish(Operation::Created, node.clone());
        Ok(())
    }

    pub(super) async fn update(&self, node: &Node) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        let Some(previous) = records.insert(node.name.clone(), node.clone()) else {
            records.remove(&node.name);
            return Err(StorageError::NotFound(node.name.clone()));
        };
        if let Err(e) = self.write(&records).await {
            records.insert(node.name.clone(), previous);
            return Err(e);
        }
        drop(records);
        self.publish(Operation::Updated, node.clone());
        Ok(())
    }

    pub(super) async fn delete(&self, name: &str) -> Result<Node, StorageError> {
        let mut records = self.records.lock().await;
        let node = records
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        if let Err(e) = self.write(&records).await {
            records.insert(name.to_string(), node);
            return Err(e);
        }
        drop(records);
        self.publish(Operation::Deleted, node.clone());
        Ok(node)
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn publish(&self, operation: Operation, node: Node) {
        let _ = self.events.send(StorageEvent { operation, node });
    }

    /// Atomically replace the registry file.
    async fn write(&self, records: &BTreeMap<String, Node>) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io {
            path: self.path.clone(),
            source,
        };

        #[derive(Serialize)]
        struct DocumentRef<'a> {
            nodes: &'a BTreeMap<String, Node>,
        }
        let mut json = serde_json::to_vec_pretty(&DocumentRef { nodes: records })
            .map_err(StorageError::Encode)?;
        json.push(b'\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        debug!(path = %self.path.display(), count = records.len(), "Wrote registry");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Backend, Storage};

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("nodes.json"));
        assert!(backend.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("nodes.json");

        let storage = Storage::new(Backend::File(FileBackend::new(path.clone())));
        storage.import_nodes().await.unwrap();
        storage
            .create(Node::new("n1", "ssh").with_param("host", "10.0.0.1"))
            .await
            .unwrap();
        storage.create(Node::new("n2", "cmd")).await.unwrap();
        storage.delete("n2").await.unwrap();
        assert!(!storage.is_async());

        let reloaded = Storage::new(Backend::File(FileBackend::new(path)));
        assert_eq!(reloaded.import_nodes().await.unwrap(), 1);
        let node = reloaded.get_node("n1").await.unwrap();
        assert_eq!(node.host(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_index_untouched() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the registry file should be makes the rename fail.
        let path = dir.path().join("nodes.json");
        std::fs::create_dir_all(path.join("blocker")).unwrap();

        let storage = Storage::new(Backend::File(FileBackend::new(path)));
        let result = storage.create(Node::new("n1", "cmd")).await;
        assert!(matches!(result, Err(StorageError::Io { .. })));
        assert!(storage.get_node("n1").await.is_none());
        assert!(storage.get_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        std::fs::write(&path, b"not json").unwrap();
        let backend = FileBackend::new(path);
        assert!(matches!(
            backend.load().await,
            Err(StorageError::Decode { .. })
        ));
    }
}
