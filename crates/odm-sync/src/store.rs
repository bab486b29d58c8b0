//! Abstract key-path document store and an in-memory implementation.

use async_trait::async_trait;
use odm_diff::{apply_patch, flatten, unflatten, Patch};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors from the underlying document store.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// One observation of a remote document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Whether the document exists at all.
    pub exists: bool,
    /// The document's current nested field mapping, if it exists.
    pub data: Option<Map<String, Value>>,
}

/// Abstract key-path document service.
///
/// `update` must apply a sparse field-level patch: only the listed paths are
/// touched, every other remote field is left as-is. `subscribe` delivers the
/// current snapshot first and then every subsequent change, in store order.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// One-shot read of the document at `path`.
    async fn get(&self, path: &str) -> Result<RemoteEvent, StoreError>;

    /// Apply a field-level patch to the document at `path`.
    async fn update(&self, path: &str, patch: Patch) -> Result<(), StoreError>;

    /// Subscribe to the document's change feed.
    async fn subscribe(&self, path: &str) -> mpsc::Receiver<RemoteEvent>;
}

type Documents = RwLock<HashMap<String, Map<String, Value>>>;
type Watchers = RwLock<HashMap<String, Vec<mpsc::Sender<RemoteEvent>>>>;

/// In-memory store for tests, demos and offline use.
///
/// Behaves like a remote store would: every accepted write (including the
/// caller's own) is echoed back through the change feed.
pub struct MemoryStore {
    documents: Documents,
    watchers: Watchers,
    writes: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Overwrite the whole document, as a foreign writer would.
    pub async fn put(&self, path: &str, fields: Map<String, Value>) {
        self.documents.write().insert(path.to_string(), fields);
        self.notify(path).await;
    }

    /// Remove the document entirely.
    pub async fn remove(&self, path: &str) {
        self.documents.write().remove(path);
        self.notify(path).await;
    }

    /// Current nested contents of the document, if it exists.
    pub fn document(&self, path: &str) -> Option<Map<String, Value>> {
        self.documents.read().get(path).cloned()
    }

    /// Number of field-level updates applied so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn snapshot_event(&self, path: &str) -> RemoteEvent {
        let data = self.document(path);
        RemoteEvent {
            exists: data.is_some(),
            data,
        }
    }

    async fn notify(&self, path: &str) {
        let event = self.snapshot_event(path);
        let senders = self
            .watchers
            .read()
            .get(path)
            .cloned()
            .unwrap_or_default();
        for tx in &senders {
            let _ = tx.send(event.clone()).await;
        }
        if let Some(list) = self.watchers.write().get_mut(path) {
            list.retain(|tx| !tx.is_closed());
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<RemoteEvent, StoreError> {
        Ok(self.snapshot_event(path))
    }

    async fn update(&self, path: &str, patch: Patch) -> Result<(), StoreError> {
        {
            let mut documents = self.documents.write();
            let doc = documents
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
            let patched = apply_patch(&flatten(doc), &patch);
            *doc = unflatten(&patched);
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(path, ops = patch.len(), "applied field update");
        self.notify(path).await;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> mpsc::Receiver<RemoteEvent> {
        let (tx, rx) = mpsc::channel(64);
        // Snapshot first, then live changes, matching the store contract.
        let _ = tx.send(self.snapshot_event(path)).await;
        self.watchers
            .write()
            .entry(path.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
