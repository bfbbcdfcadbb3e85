use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use millrace_domain::{
    AddOptions, Entry, EntryFilter, EntryId, EntryStatus, PartitionPath, StatusChange,
};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::QueueStore;

#[derive(Debug, Default)]
pub(crate) struct PartitionData {
    /// Insertion-ordered entries; queries preserve this order.
    pub(crate) entries: Vec<Entry>,
    /// Idempotent key → owning entry id.
    pub(crate) idempotent: HashMap<String, EntryId>,
}

#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) partitions: HashMap<PartitionPath, PartitionData>,
}

/// In-memory implementation of [`QueueStore`].
///
/// All data is lost on process exit. Suitable for tests and as the state
/// backing the file store. A single write guard is held across each
/// operation, which makes the id check, idempotency check, and insert of
/// `add` (and the asserted transition of `set_status`) atomic.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<RwLock<Shared>>,
    path: PartitionPath,
    destroyed: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            shared: Arc::new(RwLock::new(Shared::default())),
            path: PartitionPath::root(),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &PartitionPath {
        &self.path
    }

    /// Concrete-typed sibling of [`QueueStore::partition`]; the file store
    /// uses this to scope its inner state without trait-object erasure.
    pub fn child(&self, segment: &str) -> MemoryStore {
        MemoryStore {
            shared: Arc::clone(&self.shared),
            path: self.path.child(segment),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed);
        }
        Ok(())
    }

    /// Dump the whole queue state as partition-path → entries, for
    /// serialization by the file store.
    pub(crate) async fn snapshot(&self) -> HashMap<String, Vec<Entry>> {
        let guard = self.shared.read().await;
        guard
            .partitions
            .iter()
            .map(|(path, data)| (path.to_string(), data.entries.clone()))
            .collect()
    }

    /// Rebuild shared state from a snapshot, re-deriving the idempotency
    /// maps from the entries themselves.
    pub(crate) fn restore(snapshot: HashMap<String, Vec<Entry>>) -> Self {
        let mut shared = Shared::default();
        for (path_str, entries) in snapshot {
            let segments: Vec<&str> = path_str.split('/').filter(|s| !s.is_empty()).collect();
            let mut path = PartitionPath::root();
            for segment in segments {
                path = path.child(segment);
            }
            let mut idempotent = HashMap::new();
            for entry in &entries {
                for key in &entry.idempotent_keys {
                    idempotent.insert(key.clone(), entry.id.clone());
                }
            }
            shared
                .partitions
                .insert(path, PartitionData { entries, idempotent });
        }
        MemoryStore {
            shared: Arc::new(RwLock::new(shared)),
            path: PartitionPath::root(),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.check_alive()?;
        let mut guard = self.shared.write().await;
        let data = guard.partitions.entry(self.path.clone()).or_default();

        if let Some(id) = &opts.id {
            if data.entries.iter().any(|e| &e.id == id) {
                return Ok(id.clone());
            }
        }

        let colliding: BTreeSet<String> = opts
            .idempotent_keys
            .iter()
            .filter(|key| data.idempotent.contains_key(*key))
            .cloned()
            .collect();
        if !colliding.is_empty() {
            return Err(StoreError::IdempotentExists { keys: colliding });
        }

        let id = opts.id.unwrap_or_else(EntryId::generate);
        let mut entry = Entry::new(
            id.clone(),
            request,
            opts.status.unwrap_or(EntryStatus::Pending),
        );
        entry.idempotent_keys = opts.idempotent_keys;
        for key in &entry.idempotent_keys {
            data.idempotent.insert(key.clone(), id.clone());
        }
        data.entries.push(entry);
        Ok(id)
    }

    async fn set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError> {
        self.check_alive()?;
        let mut guard = self.shared.write().await;
        let data = guard.partitions.entry(self.path.clone()).or_default();

        let entry = data
            .entries
            .iter_mut()
            .find(|e| &e.id == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if let Some(expected) = change.old_status {
            if entry.status != expected {
                return Err(StoreError::IncorrectState {
                    id: id.clone(),
                    expected,
                    actual: entry.status,
                });
            }
        }

        entry.apply_status(new_status, &change);
        Ok(())
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.check_alive()?;
        let guard = self.shared.read().await;
        Ok(guard
            .partitions
            .get(&self.path)
            .and_then(|data| data.entries.iter().find(|e| &e.id == id))
            .cloned())
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.check_alive()?;
        let guard = self.shared.read().await;
        let Some(data) = guard.partitions.get(&self.path) else {
            return Ok(Vec::new());
        };
        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(data
            .entries
            .iter()
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .filter(|e| filter.updated_before.map_or(true, |t| e.updated < t))
            .take(limit)
            .cloned()
            .collect())
    }

    fn partition(&self, segment: &str) -> Arc<dyn QueueStore> {
        Arc::new(self.child(segment))
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
