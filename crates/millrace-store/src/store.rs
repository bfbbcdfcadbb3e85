use std::sync::Arc;

use async_trait::async_trait;
use millrace_domain::{AddOptions, Entry, EntryFilter, EntryId, EntryStatus, StatusChange};
use serde_json::Value;

use crate::error::StoreError;

/// Durable, partition-scoped persistence of queue entries.
///
/// Implementations must make each operation linearizable within a
/// partition: `add` is atomic across the id check, the idempotency check,
/// and the insert; `set_status` is atomic under its `old_status` assertion.
/// Entries handed out by `get`/`query` are owned copies; mutating them has
/// no effect on storage.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a new entry.
    ///
    /// If `opts.id` names an existing entry the call returns that id without
    /// writing. If any of `opts.idempotent_keys` is already referenced in
    /// the partition, fails with [`StoreError::IdempotentExists`] carrying
    /// the colliding subset.
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError>;

    /// Transition an entry's status, applying the ancillary effects of
    /// [`StatusChange`]. When `change.old_status` is set, the transition
    /// succeeds only if the stored status matches; otherwise
    /// [`StoreError::IncorrectState`] and no write.
    async fn set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError>;

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError>;

    /// A store handle scoped to the child partition `path ++ [segment]`.
    ///
    /// The child shares the substrate with its parent; destroying the
    /// parent instance must not invalidate the child.
    fn partition(&self, segment: &str) -> Arc<dyn QueueStore>;

    /// Release this instance. Subsequent operations on it fail with
    /// [`StoreError::Destroyed`]. Idempotent.
    async fn destroy(&self) -> Result<(), StoreError>;

    /// Backend-level housekeeping; a no-op for most stores.
    async fn maintain(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
