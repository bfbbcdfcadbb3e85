use std::sync::Arc;

use millrace_domain::{AddOptions, Entry, EntryFilter, EntryId, EntryStatus, StatusChange};
use millrace_runner::{RunOptions, StageRunner};
use millrace_store::StoreError;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// How many terminal entries one chain hand-off sweep considers.
const CHAIN_SWEEP_LIMIT: usize = 100;

struct Stage {
    name: String,
    runner: Arc<dyn StageRunner>,
}

/// A named sequence of runners where stage *N*'s completed outputs become
/// stage *N+1*'s pending inputs.
///
/// For plain chains the pipeline performs the single-item hand-off itself,
/// preserving entry ids across stages so redelivery stays idempotent.
/// A stage that carries its own pipes (batching, failure routing) keeps
/// ownership of its hand-off and the pipeline only triggers it.
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages.iter().map(|s| &s.name).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    /// Build from ordered `(name, runner)` pairs; first is the intake
    /// stage, last is the result stage.
    pub fn new<N, I>(stages: I) -> Result<Self, PipelineError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Arc<dyn StageRunner>)>,
    {
        let stages: Vec<Stage> = stages
            .into_iter()
            .map(|(name, runner)| Stage {
                name: name.into(),
                runner,
            })
            .collect();
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        Ok(Pipeline { stages })
    }

    /// Initialize every stage in order. On failure the already-initialized
    /// prefix is destroyed best-effort and the error re-raised.
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        for (index, stage) in self.stages.iter().enumerate() {
            if let Err(err) = stage.runner.initialize().await {
                warn!(stage = %stage.name, error = %err, "stage initialization failed");
                for initialized in &self.stages[..index] {
                    if let Err(destroy_err) = initialized.runner.destroy().await {
                        warn!(
                            stage = %initialized.name,
                            error = %destroy_err,
                            "cleanup destroy failed"
                        );
                    }
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Submit an input to the intake stage.
    pub async fn add<T: Serialize>(&self, input: &T) -> Result<EntryId, PipelineError> {
        let encoded = serde_json::to_value(input).map_err(StoreError::Serialization)?;
        self.add_raw(encoded, AddOptions::default()).await
    }

    pub async fn add_raw(
        &self,
        input: Value,
        opts: AddOptions,
    ) -> Result<EntryId, PipelineError> {
        Ok(self.intake().runner.add_raw(input, opts).await?)
    }

    /// Query the result stage.
    pub async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, PipelineError> {
        Ok(self.result().runner.query(filter).await?)
    }

    /// Get from the result stage.
    pub async fn get(&self, id: &EntryId) -> Result<Option<Entry>, PipelineError> {
        Ok(self.result().runner.get(id).await?)
    }

    /// Access a stage's runner by name, for inspection mid-chain.
    pub fn stage(&self, name: &str) -> Result<&Arc<dyn StageRunner>, PipelineError> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.runner)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// One pass over all stages: run each, then move its outputs along.
    /// Returns `true` while any stage reports more work.
    pub async fn run(&self, options: RunOptions) -> Result<bool, PipelineError> {
        let mut more = false;
        for (index, stage) in self.stages.iter().enumerate() {
            more |= stage.runner.run(options).await?;
            if stage.runner.has_pipes() {
                stage.runner.move_terminal_entries().await?;
            } else if let Some(next) = self.stages.get(index + 1) {
                self.chain_handoff(stage, next).await?;
            }
        }
        Ok(more)
    }

    /// Run every stage's maintenance, logging failures and continuing.
    pub async fn maintain(&self) -> Result<(), PipelineError> {
        for stage in &self.stages {
            if let Err(err) = stage.runner.maintain().await {
                warn!(stage = %stage.name, error = %err, "stage maintenance failed");
            }
        }
        Ok(())
    }

    /// Forward `destroy` to every stage, best-effort.
    pub async fn destroy(&self) -> Result<(), PipelineError> {
        for stage in &self.stages {
            if let Err(err) = stage.runner.destroy().await {
                warn!(stage = %stage.name, error = %err, "stage destroy failed");
            }
        }
        Ok(())
    }

    fn intake(&self) -> &Stage {
        // Construction guarantees at least one stage.
        &self.stages[0]
    }

    fn result(&self) -> &Stage {
        &self.stages[self.stages.len() - 1]
    }

    /// Single-item hand-off between consecutive unpiped stages: a completed
    /// entry's output becomes the next stage's request under the same id
    /// (plus an idempotent key), then the source is marked `moved`.
    async fn chain_handoff(&self, from: &Stage, to: &Stage) -> Result<(), PipelineError> {
        let candidates = from
            .runner
            .query(
                EntryFilter::status(EntryStatus::Completed).limit(CHAIN_SWEEP_LIMIT),
            )
            .await?;

        for candidate in candidates {
            let input = candidate.output.clone().unwrap_or(Value::Null);
            let opts = AddOptions::with_id(candidate.id.clone())
                .idempotent_key(candidate.id.to_string());
            match to.runner.add_raw(input, opts).await {
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        from = %from.name,
                        to = %to.name,
                        id = %candidate.id,
                        error = %err,
                        "chain hand-off failed"
                    );
                    continue;
                }
            }
            match from
                .runner
                .set_status_raw(
                    &candidate.id,
                    EntryStatus::Moved,
                    StatusChange::expecting(EntryStatus::Completed),
                )
                .await
            {
                Ok(()) => {
                    debug!(from = %from.name, to = %to.name, id = %candidate.id, "moved");
                }
                Err(StoreError::IncorrectState { .. }) => {}
                Err(err) => {
                    warn!(id = %candidate.id, error = %err, "move transition failed");
                }
            }
        }
        Ok(())
    }
}
