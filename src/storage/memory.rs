//! Shared in-process backend.
//!
//! Clones of a `MemoryBackend` share one record map and one event channel,
//! which makes several `Storage` instances behave like peers of a clustered
//! store: each sees the others' writes only through the watch stream.

use super::{EVENT_CAPACITY, Operation, StorageError, StorageEvent};
use crate::node::Node;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

struct Shared {
    records: Mutex<BTreeMap<String, Node>>,
    events: broadcast::Sender<StorageEvent>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, Node>> {
        self.shared
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, operation: Operation, node: Node) {
        // No subscribers is fine.
        let _ = self.shared.events.send(StorageEvent { operation, node });
    }

    pub(super) fn load(&self) -> Vec<Node> {
        self.records().values().cloned().collect()
    }

    pub(super) fn get(&self, name: &str) -> Option<Node> {
        self.records().get(name).cloned()
    }

    pub(super) fn create(&self, node: &Node) -> Result<(), StorageError> {
        {
            let mut records = self.records();
            if records.contains_key(&node.name) {
                return Err(StorageError::AlreadyExists(node.name.clone()));
            }
            records.insert(node.name.clone(), node.clone());
        }
        self.publish(Operation::Created, node.clone());
        Ok(())
    }

    pub(super) fn update(&self, node: &Node) -> Result<(), StorageError> {
        {
            let mut records = self.records();
            let Some(slot) = records.get_mut(&node.name) else {
                return Err(StorageError::NotFound(node.name.clone()));
            };
            slot.clone_from(node);
        }
        self.publish(Operation::Updated, node.clone());
        Ok(())
    }

    pub(super) fn delete(&self, name: &str) -> Result<Node, StorageError> {
        let node = self
            .records()
            .remove(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        self.publish(Operation::Deleted, node.clone());
        Ok(node)
    }

    pub(super) fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}
