use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use millrace_domain::{AddOptions, Entry, EntryFilter, EntryId, EntryStatus, StatusChange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::QueueStore;

/// On-disk layout: the whole queue state under one top-level key.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    queue: HashMap<String, Vec<Entry>>,
}

/// Single-file implementation of [`QueueStore`].
///
/// Owns a [`MemoryStore`] and decorates every mutating operation with a
/// snapshot of the full queue state: serialize to a sibling temp file, then
/// atomically rename over the target. Snapshot writes are funneled through
/// one FIFO mutex so they land in submission order. Opening an existing
/// file rehydrates the in-memory state, including the per-partition
/// idempotency indexes.
#[derive(Clone)]
pub struct FileStore {
    memory: MemoryStore,
    file: Arc<PathBuf>,
    writer: Arc<Mutex<()>>,
    destroyed: Arc<AtomicBool>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let memory = match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: SnapshotFile = serde_json::from_slice(&bytes)?;
                MemoryStore::restore(snapshot.queue)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => return Err(StoreError::substrate(err)),
        };
        Ok(FileStore {
            memory,
            file: Arc::new(path),
            writer: Arc::new(Mutex::new(())),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn file_path(&self) -> &std::path::Path {
        &self.file
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed);
        }
        Ok(())
    }

    /// Write the current full state to disk. The snapshot is taken under
    /// the writer lock, so a later mutation can only make the written state
    /// newer, never older.
    async fn persist(&self) -> Result<(), StoreError> {
        let _slot = self.writer.lock().await;
        let snapshot = SnapshotFile {
            queue: self.memory.snapshot().await,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let file_name = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue".to_string());
        let temp = self.file.with_file_name(format!("{file_name}.tmp"));
        std::fs::write(&temp, &bytes).map_err(StoreError::substrate)?;
        std::fs::rename(&temp, self.file.as_ref()).map_err(StoreError::substrate)?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for FileStore {
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.check_alive()?;
        let id = self.memory.add(request, opts).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError> {
        self.check_alive()?;
        self.memory.set_status(id, new_status, change).await?;
        self.persist().await
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.check_alive()?;
        self.memory.get(id).await
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.check_alive()?;
        self.memory.query(filter).await
    }

    fn partition(&self, segment: &str) -> Arc<dyn QueueStore> {
        Arc::new(FileStore {
            memory: self.memory.child(segment),
            file: Arc::clone(&self.file),
            writer: Arc::clone(&self.writer),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let store = FileStore::open(&path).unwrap();
            let id = store
                .add(json!({"key": "one"}), AddOptions::with_id("e1"))
                .await
                .unwrap();
            store
                .set_status(
                    &id,
                    EntryStatus::Completed,
                    StatusChange::expecting(EntryStatus::Pending).output(json!("OK")),
                )
                .await
                .unwrap();
        }

        // A new instance over the same file observes the committed state.
        let store = FileStore::open(&path).unwrap();
        let entry = store.get(&EntryId::new("e1")).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.output, Some(json!("OK")));
        assert_eq!(entry.request, json!({"key": "one"}));
    }

    #[tokio::test]
    async fn disk_layout_has_queue_top_level_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let store = FileStore::open(&path).unwrap();
        store
            .add(json!(1), AddOptions::with_id("e1").idempotent_key("K"))
            .await
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let root_partition = &raw["queue"][""];
        assert_eq!(root_partition[0]["id"], "e1");
        assert_eq!(root_partition[0]["idempotentKeys"], json!(["K"]));
        assert!(root_partition[0]["created"].is_string());
    }

    #[tokio::test]
    async fn partitions_share_the_file_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let store = FileStore::open(&path).unwrap();
            let fx = store.partition("fx");
            store.add(json!("root"), AddOptions::with_id("same")).await.unwrap();
            fx.add(json!("fx"), AddOptions::with_id("same")).await.unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        let fx = store.partition("fx");
        let id = EntryId::new("same");
        assert_eq!(store.get(&id).await.unwrap().unwrap().request, json!("root"));
        assert_eq!(fx.get(&id).await.unwrap().unwrap().request, json!("fx"));
    }

    #[tokio::test]
    async fn idempotency_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        {
            let store = FileStore::open(&path).unwrap();
            store
                .add(json!(1), AddOptions::with_id("a").idempotent_key("P"))
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        let err = store
            .add(json!(2), AddOptions::with_id("b").idempotent_key("P"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IdempotentExists { .. }));
    }

    #[tokio::test]
    async fn destroyed_instance_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("queue.json")).unwrap();
        store.destroy().await.unwrap();
        assert!(matches!(
            store.add(json!(1), AddOptions::default()).await.unwrap_err(),
            StoreError::Destroyed
        ));
    }
}
