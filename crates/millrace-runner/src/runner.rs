use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use millrace_domain::{AddOptions, Entry, EntryFilter, EntryId, EntryStatus, StatusChange};
use millrace_store::{QueueStore, StoreError};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::config::{RunOptions, RunnerConfig};
use crate::error::RunnerError;
use crate::lock::{WorkerLock, RUNNER_LOCK_PREFIX};
use crate::pipe::{BatchOptions, Pipe, StageRunner};
use crate::processor::Processor;

/// Query window for maintenance sweeps and stage hand-off.
const SWEEP_LIMIT: usize = 100;

/// Short batches tolerated before a batching pipe gives up for the cycle.
const SHORT_BATCH_LIMIT: u32 = 3;

/// Drives one queue: leases pending entries to the processor, translates
/// verdicts into status transitions, and owns retry, timeout, and stuck
/// handling plus the hand-off into downstream pipes.
pub struct Runner<C: Codec> {
    id: String,
    store: Arc<dyn QueueStore>,
    codec: C,
    processor: Arc<dyn Processor<C::Request, C::Response>>,
    processor_aborted: Option<Arc<dyn Processor<C::Request, C::Response>>>,
    processor_stuck: Option<Arc<dyn Processor<C::Request, C::Response>>>,
    config: RunnerConfig,
    pipes: Vec<Pipe>,
    lock: WorkerLock,
    initialized: OnceCell<()>,
}

impl<C: Codec> Runner<C> {
    pub fn new(
        store: Arc<dyn QueueStore>,
        codec: C,
        processor: Arc<dyn Processor<C::Request, C::Response>>,
        config: RunnerConfig,
    ) -> Self {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lock = WorkerLock::new(
            Arc::clone(&store),
            &id,
            config.workers.id,
            config.stuck_after(),
        );
        Runner {
            id,
            store,
            codec,
            processor,
            processor_aborted: None,
            processor_stuck: None,
            config,
            pipes: Vec::new(),
            lock,
            initialized: OnceCell::new(),
        }
    }

    /// Attach a downstream pipe. Pipes are fixed at construction so the
    /// stage graph stays a DAG of owned handles.
    pub fn with_pipe(mut self, pipe: Pipe) -> Self {
        self.pipes.push(pipe);
        self
    }

    /// Dedicated processor re-fed entries observed in `aborted`.
    pub fn with_aborted_processor(
        mut self,
        processor: Arc<dyn Processor<C::Request, C::Response>>,
    ) -> Self {
        self.processor_aborted = Some(processor);
        self
    }

    /// Dedicated processor re-fed entries observed in `stuck`.
    pub fn with_stuck_processor(
        mut self,
        processor: Arc<dyn Processor<C::Request, C::Response>>,
    ) -> Self {
        self.processor_stuck = Some(processor);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Validate configuration and insert the worker-lock sentinel. Runs
    /// once; later calls are free.
    pub async fn initialize(&self) -> Result<(), RunnerError> {
        self.initialized
            .get_or_try_init(|| async {
                self.config.validate()?;
                self.lock.ensure().await?;
                Ok::<(), RunnerError>(())
            })
            .await?;
        Ok(())
    }

    // ── Typed API ────────────────────────────────────────────────────────────

    pub async fn add(&self, request: &C::Request) -> Result<EntryId, RunnerError> {
        self.add_with(request, AddOptions::default()).await
    }

    pub async fn add_with(
        &self,
        request: &C::Request,
        opts: AddOptions,
    ) -> Result<EntryId, RunnerError> {
        let encoded = self.codec.encode_request(request)?;
        Ok(self.store.add(encoded, opts).await?)
    }

    pub async fn get(&self, id: &EntryId) -> Result<Option<Entry>, RunnerError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, RunnerError> {
        Ok(self.store.query(filter).await?)
    }

    /// Decode the stored output of a completed entry back into the user's
    /// response type.
    pub fn decode_output(&self, entry: &Entry) -> Result<Option<C::Response>, RunnerError> {
        entry
            .output
            .clone()
            .map(|raw| self.codec.decode_response(raw))
            .transpose()
            .map_err(RunnerError::from)
    }

    // ── Run cycle ────────────────────────────────────────────────────────────

    /// One processing pass.
    ///
    /// Returns `true` when more work likely remains (a full batch was
    /// processed, a peer held the lock, or a pipe reported more); `false`
    /// when an empty pending set was observed.
    pub async fn run(&self, options: RunOptions) -> Result<bool, RunnerError> {
        self.initialize().await?;
        if !self.lock.acquire().await? {
            debug!(runner = %self.id, worker = self.config.workers.id, "worker lock held by peer");
            return Ok(true);
        }
        let result = self.run_locked(&options).await;
        self.lock.release().await;
        result
    }

    async fn run_locked(&self, options: &RunOptions) -> Result<bool, RunnerError> {
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let worker = self.config.workers.id;
        let mut saw_empty = false;

        for _ in 0..self.config.batch_size {
            let mut pending = self
                .store
                .query(EntryFilter::status(EntryStatus::Pending).limit(1))
                .await?;
            let Some(entry) = pending.pop() else {
                saw_empty = true;
                break;
            };

            self.lock.heartbeat().await;

            match self
                .store
                .set_status(
                    &entry.id,
                    EntryStatus::Processing,
                    StatusChange::expecting(EntryStatus::Pending).by(worker),
                )
                .await
            {
                Ok(()) => self.process_one(&entry, &self.processor).await?,
                // A peer raced us to the claim; move on.
                Err(StoreError::IncorrectState { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }

            if expired(deadline) {
                break;
            }
        }

        let mut pipe_more = false;
        for pipe in self.pipes.iter().filter(|p| p.exclusive_target) {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            pipe_more |= pipe.target.run(RunOptions { timeout: remaining }).await?;
        }

        if let Some(processor) = &self.processor_aborted {
            self.drain(EntryStatus::Aborted, processor, deadline).await?;
        }
        if let Some(processor) = &self.processor_stuck {
            self.drain(EntryStatus::Stuck, processor, deadline).await?;
        }

        Ok(!saw_empty || pipe_more)
    }

    /// Re-feed entries sitting in `aborted` or `stuck` to a dedicated
    /// processor, with the same lease-then-work shape as the main loop.
    async fn drain(
        &self,
        from: EntryStatus,
        processor: &Arc<dyn Processor<C::Request, C::Response>>,
        deadline: Option<Instant>,
    ) -> Result<(), RunnerError> {
        let worker = self.config.workers.id;
        for _ in 0..self.config.batch_size {
            if expired(deadline) {
                break;
            }
            let mut found = self
                .store
                .query(EntryFilter::status(from).limit(1))
                .await?;
            let Some(entry) = found.pop() else {
                break;
            };

            self.lock.heartbeat().await;

            match self
                .store
                .set_status(
                    &entry.id,
                    EntryStatus::Processing,
                    StatusChange::expecting(from).by(worker),
                )
                .await
            {
                Ok(()) => self.process_one(&entry, processor).await?,
                Err(StoreError::IncorrectState { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Run the processor on one claimed entry and record its verdict.
    /// Processor failures become entry state, never propagated errors.
    async fn process_one(
        &self,
        entry: &Entry,
        processor: &Arc<dyn Processor<C::Request, C::Response>>,
    ) -> Result<(), RunnerError> {
        let worker = self.config.workers.id;

        let request = match self.codec.decode_request(entry.request.clone()) {
            Ok(request) => request,
            Err(err) => {
                self.record(
                    entry,
                    EntryStatus::FailedTemporarily,
                    StatusChange::expecting(EntryStatus::Processing)
                        .by(worker)
                        .error(format!("decode request: {err}")),
                )
                .await?;
                return Ok(());
            }
        };

        let outcome =
            tokio::time::timeout(self.config.process_timeout, processor.process(request, entry))
                .await;

        let (status, change) = match outcome {
            Ok(Ok(verdict)) => {
                let mut change = StatusChange::expecting(EntryStatus::Processing).by(worker);
                if let Some(error) = verdict.error {
                    change = change.error(error);
                }
                match verdict.output {
                    Some(output) => match self.codec.encode_response(&output) {
                        Ok(value) => (verdict.status.entry_status(), change.output(value)),
                        Err(err) => (
                            EntryStatus::FailedTemporarily,
                            change.error(format!("encode output: {err}")),
                        ),
                    },
                    None => (verdict.status.entry_status(), change),
                }
            }
            Ok(Err(err)) => (
                EntryStatus::FailedTemporarily,
                StatusChange::expecting(EntryStatus::Processing)
                    .by(worker)
                    .error(format!("{err:#}")),
            ),
            Err(_) => (
                EntryStatus::Aborted,
                StatusChange::expecting(EntryStatus::Processing)
                    .by(worker)
                    .error(format!(
                        "processor exceeded {:?} budget",
                        self.config.process_timeout
                    )),
            ),
        };

        self.record(entry, status, change).await
    }

    async fn record(
        &self,
        entry: &Entry,
        status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), RunnerError> {
        match self.store.set_status(&entry.id, status, change).await {
            Ok(()) => Ok(()),
            // The entry left `processing` under us (e.g. a late verdict
            // after the timeout already fired); the earlier transition wins.
            Err(StoreError::IncorrectState { actual, .. }) => {
                debug!(id = %entry.id, %status, %actual, "verdict discarded, entry moved on");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // ── Maintenance cycle ────────────────────────────────────────────────────

    /// Periodic upkeep, invoked by an external scheduler. Worker 0 is the
    /// maintenance leader; other workers only refresh their lock. Each
    /// sub-task failure is logged and the cycle continues.
    pub async fn maintain(&self) -> Result<(), RunnerError> {
        self.initialize().await?;
        self.lock.heartbeat().await;

        if self.config.workers.id != 0 {
            return Ok(());
        }

        if let Err(err) = self.mark_stuck().await {
            warn!(runner = %self.id, error = %err, "stuck sweep failed");
        }
        if let Err(err) = self.requeue_failed().await {
            warn!(runner = %self.id, error = %err, "requeue sweep failed");
        }
        if let Err(err) = self.move_terminal_for(EntryStatus::Completed).await {
            warn!(runner = %self.id, error = %err, "completed hand-off failed");
        }
        if let Err(err) = self.move_terminal_for(EntryStatus::FailedPermanently).await {
            warn!(runner = %self.id, error = %err, "failure hand-off failed");
        }
        for pipe in self.pipes.iter().filter(|p| p.exclusive_target) {
            if let Err(err) = pipe.target.maintain().await {
                warn!(runner = %self.id, error = %err, "pipe maintenance failed");
            }
        }
        if let Err(err) = self.store.maintain().await {
            warn!(runner = %self.id, error = %err, "store maintenance failed");
        }
        Ok(())
    }

    /// `processing` entries whose heartbeat aged past the stuck window are
    /// presumed orphaned by a dead worker.
    async fn mark_stuck(&self) -> Result<(), RunnerError> {
        let threshold = cutoff(self.config.stuck_after());
        let entries = self
            .store
            .query(
                EntryFilter::status(EntryStatus::Processing)
                    .updated_before(threshold)
                    .limit(SWEEP_LIMIT),
            )
            .await?;

        for entry in entries {
            if entry.id.as_str().starts_with(RUNNER_LOCK_PREFIX) {
                continue;
            }
            match self
                .store
                .set_status(
                    &entry.id,
                    EntryStatus::Stuck,
                    StatusChange::expecting(EntryStatus::Processing),
                )
                .await
            {
                Ok(()) => warn!(id = %entry.id, "entry marked stuck"),
                Err(StoreError::IncorrectState { .. }) => {}
                Err(err) => warn!(id = %entry.id, error = %err, "stuck transition failed"),
            }
        }
        Ok(())
    }

    /// Aged `failed_temporarily` entries go back to `pending`, or to
    /// `failed_permanently` once the retry budget is spent.
    async fn requeue_failed(&self) -> Result<(), RunnerError> {
        let threshold = cutoff(self.config.effective_retry_delay());
        let entries = self
            .store
            .query(
                EntryFilter::status(EntryStatus::FailedTemporarily)
                    .updated_before(threshold)
                    .limit(SWEEP_LIMIT),
            )
            .await?;

        for entry in entries {
            let next = if entry.failures >= self.config.max_retries {
                EntryStatus::FailedPermanently
            } else {
                EntryStatus::Pending
            };
            match self
                .store
                .set_status(
                    &entry.id,
                    next,
                    StatusChange::expecting(EntryStatus::FailedTemporarily),
                )
                .await
            {
                Ok(()) => debug!(id = %entry.id, status = %next, failures = entry.failures, "requeued"),
                Err(StoreError::IncorrectState { .. }) => {}
                Err(err) => warn!(id = %entry.id, error = %err, "requeue transition failed"),
            }
        }
        Ok(())
    }

    // ── Stage hand-off ───────────────────────────────────────────────────────

    /// Deliver entries in `target_status` to every accepting pipe, then mark
    /// fully-delivered entries `moved`. Partial delivery leaves an entry in
    /// place for the next cycle; `add` downstream is idempotent on id, so
    /// redelivery is safe.
    async fn move_terminal_for(&self, target_status: EntryStatus) -> Result<(), RunnerError> {
        let accepting: Vec<&Pipe> = self
            .pipes
            .iter()
            .filter(|p| p.accept == target_status)
            .collect();
        if accepting.is_empty() {
            return Ok(());
        }

        let candidates = self
            .store
            .query(EntryFilter::status(target_status).limit(SWEEP_LIMIT))
            .await?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut delivered: HashMap<EntryId, usize> = HashMap::new();
        for &pipe in &accepting {
            match pipe.batch {
                None => {
                    for candidate in &candidates {
                        let input = handoff_input(candidate, target_status);
                        match pipe
                            .target
                            .add_raw(input, AddOptions::with_id(candidate.id.clone()))
                            .await
                        {
                            Ok(_) => {
                                *delivered.entry(candidate.id.clone()).or_default() += 1;
                            }
                            Err(err) => {
                                warn!(id = %candidate.id, error = %err, "hand-off failed");
                            }
                        }
                    }
                }
                Some(batch) => {
                    self.handoff_batched(pipe, batch, &candidates, target_status, &mut delivered)
                        .await;
                }
            }
        }

        for candidate in &candidates {
            if delivered.get(&candidate.id).copied().unwrap_or(0) < accepting.len() {
                continue;
            }
            match self
                .store
                .set_status(
                    &candidate.id,
                    EntryStatus::Moved,
                    StatusChange::expecting(target_status),
                )
                .await
            {
                Ok(()) | Err(StoreError::IncorrectState { .. }) => {}
                Err(err) => warn!(id = %candidate.id, error = %err, "move transition failed"),
            }
        }
        Ok(())
    }

    /// Submit candidates as size-bounded batches. Each batch becomes one
    /// downstream entry (fresh uuid id, request = array of member inputs,
    /// idempotent keys = member ids); `IdempotentExists` reports which
    /// members an earlier cycle already delivered.
    async fn handoff_batched(
        &self,
        pipe: &Pipe,
        batch_opts: BatchOptions,
        candidates: &[Entry],
        target_status: EntryStatus,
        delivered: &mut HashMap<EntryId, usize>,
    ) {
        let mut accepted: HashSet<EntryId> = HashSet::new();
        let mut skip: HashSet<EntryId> = HashSet::new();
        let mut short_batches = 0;

        loop {
            let batch: Vec<&Entry> = candidates
                .iter()
                .filter(|e| !accepted.contains(&e.id) && !skip.contains(&e.id))
                .take(batch_opts.max_size)
                .collect();
            if batch.is_empty() {
                break;
            }
            if batch.len() < batch_opts.min_size {
                short_batches += 1;
                if short_batches >= SHORT_BATCH_LIMIT {
                    debug!(
                        runner = %self.id,
                        size = batch.len(),
                        "giving up on short batch this cycle"
                    );
                    break;
                }
                continue;
            }

            let inputs: Vec<Value> = batch
                .iter()
                .map(|e| handoff_input(e, target_status))
                .collect();
            let member_ids: BTreeSet<String> =
                batch.iter().map(|e| e.id.to_string()).collect();
            let mut opts = AddOptions::with_id(EntryId::generate());
            opts.idempotent_keys = member_ids;

            match pipe.target.add_raw(Value::Array(inputs), opts).await {
                Ok(_) => {
                    short_batches = 0;
                    for entry in &batch {
                        accepted.insert(entry.id.clone());
                        *delivered.entry(entry.id.clone()).or_default() += 1;
                    }
                }
                Err(StoreError::IdempotentExists { keys }) => {
                    // Those members already landed downstream in an earlier
                    // cycle; count them and re-form from the remainder.
                    for key in keys {
                        let id = EntryId::new(key);
                        if accepted.insert(id.clone()) {
                            *delivered.entry(id).or_default() += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "batch hand-off failed");
                    for entry in &batch {
                        skip.insert(entry.id.clone());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<C: Codec> StageRunner for Runner<C> {
    async fn initialize(&self) -> Result<(), RunnerError> {
        Runner::initialize(self).await
    }

    async fn add_raw(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.store.add(request, opts).await
    }

    async fn set_status_raw(
        &self,
        id: &EntryId,
        status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError> {
        self.store.set_status(id, status, change).await
    }

    async fn run(&self, options: RunOptions) -> Result<bool, RunnerError> {
        Runner::run(self, options).await
    }

    async fn maintain(&self) -> Result<(), RunnerError> {
        Runner::maintain(self).await
    }

    async fn move_terminal_entries(&self) -> Result<(), RunnerError> {
        self.move_terminal_for(EntryStatus::Completed).await?;
        self.move_terminal_for(EntryStatus::FailedPermanently).await
    }

    fn has_pipes(&self) -> bool {
        !self.pipes.is_empty()
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.store.get(id).await
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.store.query(filter).await
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.store.destroy().await
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn cutoff(age: Duration) -> DateTime<Utc> {
    let millis = age.as_millis().min(i64::MAX as u128) as i64;
    Utc::now() - chrono::Duration::milliseconds(millis)
}

/// What the next stage receives: a completed entry contributes its output,
/// a permanently failed one its original request.
fn handoff_input(entry: &Entry, target_status: EntryStatus) -> Value {
    if target_status == EntryStatus::Completed {
        entry.output.clone().unwrap_or(Value::Null)
    } else {
        entry.request.clone()
    }
}
