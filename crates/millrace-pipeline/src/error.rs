use millrace_runner::RunnerError;
use millrace_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}
