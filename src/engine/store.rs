//! Durable thread snapshots.
//!
//! The orchestrator hands a snapshot to its [`ThreadStore`] after every
//! transition. It only needs eventual durability: a failed save is logged
//! and the in-memory thread carries on.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use super::thread::ConversationThread;
use crate::OrchestratorError;

/// Thread store failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// No snapshot exists for the id.
    #[error("thread {0} not found")]
    NotFound(Uuid),
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),
    /// Snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Store(e.to_string())
    }
}

/// Durable record of thread state.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Persist the latest snapshot of a thread, replacing any previous one.
    async fn save_snapshot(&self, thread: &ConversationThread) -> Result<(), StoreError>;

    /// Load the latest snapshot of a thread.
    async fn load_snapshot(&self, id: Uuid) -> Result<ConversationThread, StoreError>;
}

/// Process-local store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryThreadStore {
    threads: DashMap<Uuid, ConversationThread>,
}

impl InMemoryThreadStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored threads.
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[async_trait]
impl ThreadStore for InMemoryThreadStore {
    async fn save_snapshot(&self, thread: &ConversationThread) -> Result<(), StoreError> {
        self.threads.insert(thread.id, thread.clone());
        Ok(())
    }

    async fn load_snapshot(&self, id: Uuid) -> Result<ConversationThread, StoreError> {
        self.threads
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(StoreError::NotFound(id))
    }
}

/// One pretty-printed JSON file per thread, `<dir>/<id>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// reader never sees a half-written snapshot.
#[derive(Debug, Clone)]
pub struct JsonFileThreadStore {
    dir: PathBuf,
}

impl JsonFileThreadStore {
    /// Store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ThreadStore for JsonFileThreadStore {
    async fn save_snapshot(&self, thread: &ConversationThread) -> Result<(), StoreError> {
        let json =
            serde_json::to_vec_pretty(thread).map_err(|e| StoreError::Serde(e.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", self.dir.display())))?;

        let path = self.path_for(thread.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))
    }

    async fn load_snapshot(&self, id: Uuid) -> Result<ConversationThread, StoreError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id))
            }
            Err(e) => return Err(StoreError::Io(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Serde(e.to_string()))
    }
}
