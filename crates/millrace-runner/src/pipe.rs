use std::sync::Arc;

use async_trait::async_trait;
use millrace_domain::{AddOptions, Entry, EntryFilter, EntryId, EntryStatus, StatusChange};
use millrace_store::StoreError;
use serde_json::Value;

use crate::config::RunOptions;
use crate::error::RunnerError;

/// Object-safe facade over a runner, erased of its codec types.
///
/// Pipes and pipelines speak raw JSON at this seam: a stage's stored output
/// is already the encoding the next stage stores as its request.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn initialize(&self) -> Result<(), RunnerError>;

    /// Add an already-encoded request.
    async fn add_raw(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError>;

    /// Transition an entry directly; the escape hatch pipelines use to mark
    /// sources `moved` after a chain hand-off.
    async fn set_status_raw(
        &self,
        id: &EntryId,
        status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError>;

    async fn run(&self, options: RunOptions) -> Result<bool, RunnerError>;

    async fn maintain(&self) -> Result<(), RunnerError>;

    /// Hand terminal entries to the attached pipes (both `completed` and
    /// `failed_permanently` sweeps).
    async fn move_terminal_entries(&self) -> Result<(), RunnerError>;

    /// Whether this runner routes its own terminal entries through pipes; a
    /// pipeline leaves hand-off to the runner when it does.
    fn has_pipes(&self) -> bool;

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError>;

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError>;

    async fn destroy(&self) -> Result<(), StoreError>;
}

impl std::fmt::Debug for dyn StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn StageRunner")
    }
}

/// Batch sizing for a batching pipe.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub min_size: usize,
    pub max_size: usize,
}

/// Directional link from one runner to another.
///
/// Entries reaching `accept` are delivered to `target` as pending inputs.
/// Pipes only ever point downstream; composition forms a DAG of owned
/// handles, never back references.
pub struct Pipe {
    pub(crate) target: Arc<dyn StageRunner>,
    pub(crate) accept: EntryStatus,
    pub(crate) batch: Option<BatchOptions>,
    /// When set (the default), this runner also drives and maintains the
    /// target during its own cycles.
    pub(crate) exclusive_target: bool,
}

impl Pipe {
    /// A single-item pipe delivering `completed` outputs.
    pub fn to(target: Arc<dyn StageRunner>) -> Self {
        Pipe {
            target,
            accept: EntryStatus::Completed,
            batch: None,
            exclusive_target: true,
        }
    }

    /// Route `failed_permanently` entries (their original requests) instead
    /// of completed outputs; the recovery-stage hookup.
    pub fn for_failures(mut self) -> Self {
        self.accept = EntryStatus::FailedPermanently;
        self
    }

    /// Deliver size-bounded batches instead of single items. A batch is one
    /// downstream entry whose request is the array of member inputs and
    /// whose idempotent keys are the member ids.
    pub fn batched(mut self, min_size: usize, max_size: usize) -> Self {
        self.batch = Some(BatchOptions { min_size, max_size });
        self
    }

    /// Mark the target as shared with other drivers: this runner will
    /// deliver entries to it but not run or maintain it.
    pub fn shared_target(mut self) -> Self {
        self.exclusive_target = false;
        self
    }
}
