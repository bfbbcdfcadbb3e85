use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use millrace_domain::{AddOptions, EntryId, EntryStatus, StatusChange};
use millrace_store::{QueueStore, StoreError};
use tracing::{debug, warn};

use crate::error::RunnerError;

/// Id prefix shared by all lock sentinels; maintenance passes skip it.
pub const RUNNER_LOCK_PREFIX: &str = "@runner-lock:";

const RELEASE_ATTEMPTS: u32 = 3;

/// Cooperative lock between peer workers, held as a sentinel entry.
///
/// Acquisition and release ride on the store's status-asserted transitions:
/// `@internal → processing` takes the lock, the reverse releases it, and a
/// `processing ← processing` refresh is the heartbeat. Workers with
/// different ids hold disjoint sentinels and proceed concurrently; workers
/// sharing an id serialize through the same one.
pub(crate) struct WorkerLock {
    store: Arc<dyn QueueStore>,
    id: EntryId,
    worker: u32,
    stale_after: Duration,
}

impl WorkerLock {
    pub(crate) fn new(
        store: Arc<dyn QueueStore>,
        runner_id: &str,
        worker: u32,
        stale_after: Duration,
    ) -> Self {
        WorkerLock {
            store,
            id: EntryId::new(format!("{RUNNER_LOCK_PREFIX}{runner_id}.worker.{worker}")),
            worker,
            stale_after,
        }
    }

    /// Insert the sentinel; idempotent on the fixed id.
    pub(crate) async fn ensure(&self) -> Result<(), RunnerError> {
        self.store
            .add(
                serde_json::Value::Null,
                AddOptions::with_id(self.id.clone()).status(EntryStatus::Internal),
            )
            .await?;
        Ok(())
    }

    /// Try to take the lock; `false` means a live peer holds it.
    ///
    /// A holder whose heartbeat has aged past `stale_after` is presumed
    /// dead: the sentinel is forced back to `@internal` and acquisition is
    /// retried once.
    pub(crate) async fn acquire(&self) -> Result<bool, RunnerError> {
        match self.try_take().await {
            Ok(()) => Ok(true),
            Err(StoreError::IncorrectState { .. }) => self.take_over_if_stale().await,
            Err(StoreError::NotFound(_)) => {
                self.ensure().await?;
                match self.try_take().await {
                    Ok(()) => Ok(true),
                    Err(StoreError::IncorrectState { .. }) => Ok(false),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn try_take(&self) -> Result<(), StoreError> {
        self.store
            .set_status(
                &self.id,
                EntryStatus::Processing,
                StatusChange::expecting(EntryStatus::Internal).by(self.worker),
            )
            .await
    }

    async fn take_over_if_stale(&self) -> Result<bool, RunnerError> {
        let Some(sentinel) = self.store.get(&self.id).await? else {
            return Ok(false);
        };
        if sentinel.status != EntryStatus::Processing {
            return Ok(false);
        }
        let age = Utc::now() - sentinel.updated;
        if age.num_milliseconds() < self.stale_after.as_millis() as i64 {
            return Ok(false);
        }

        warn!(
            lock = %self.id,
            held_by = ?sentinel.worker,
            age_ms = age.num_milliseconds(),
            "worker lock is stale, taking over"
        );
        match self
            .store
            .set_status(
                &self.id,
                EntryStatus::Internal,
                StatusChange::expecting(EntryStatus::Processing),
            )
            .await
        {
            Ok(()) => {}
            // Someone else reset or re-took it first.
            Err(StoreError::IncorrectState { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        match self.try_take().await {
            Ok(()) => Ok(true),
            Err(StoreError::IncorrectState { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Release with bounded retry; failure is tolerated, since a stuck
    /// sentinel will be taken over once it goes stale.
    pub(crate) async fn release(&self) {
        for attempt in 0..RELEASE_ATTEMPTS {
            match self
                .store
                .set_status(
                    &self.id,
                    EntryStatus::Internal,
                    StatusChange::expecting(EntryStatus::Processing),
                )
                .await
            {
                Ok(()) => return,
                Err(err) => {
                    debug!(lock = %self.id, attempt, error = %err, "lock release failed");
                    tokio::time::sleep(Duration::from_millis(10 * (attempt as u64 + 1))).await;
                }
            }
        }
        warn!(lock = %self.id, "giving up on lock release");
    }

    /// Advance the sentinel's `updated` while holding the lock. Errors are
    /// swallowed; a missed heartbeat only hastens takeover.
    pub(crate) async fn heartbeat(&self) {
        if let Err(err) = self
            .store
            .set_status(
                &self.id,
                EntryStatus::Processing,
                StatusChange::expecting(EntryStatus::Processing).by(self.worker),
            )
            .await
        {
            debug!(lock = %self.id, error = %err, "lock heartbeat failed");
        }
    }
}
