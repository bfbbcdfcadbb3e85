use std::collections::BTreeSet;

use millrace_domain::{EntryId, EntryStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// `add` rejected; carries only the subset of keys that collided.
    #[error("idempotent keys already present: {}", join_keys(keys))]
    IdempotentExists { keys: BTreeSet<String> },

    /// `set_status` rejected because the asserted prior status did not hold.
    #[error("entry {id}: expected status {expected}, found {actual}")]
    IncorrectState {
        id: EntryId,
        expected: EntryStatus,
        actual: EntryStatus,
    },

    #[error("entry not found: {0}")]
    NotFound(EntryId),

    #[error("store instance has been destroyed")]
    Destroyed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Passthrough from the backend: busy after exhausted retries,
    /// connection lost, corrupted row, and the like.
    #[error("substrate error: {0}")]
    Substrate(String),
}

impl StoreError {
    pub fn substrate(err: impl std::fmt::Display) -> Self {
        StoreError::Substrate(err.to_string())
    }
}

fn join_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(", ")
}
