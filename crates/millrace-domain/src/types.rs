use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new(s: impl Into<String>) -> Self {
        EntryId(s.into())
    }

    /// A fresh random id (uuid v4), the default when the caller supplies none.
    pub fn generate() -> Self {
        EntryId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        EntryId(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        EntryId(s)
    }
}

// ── Partitions ───────────────────────────────────────────────────────────────

/// Hierarchical namespace inside a single store.
///
/// The root partition is the empty path. Child partitions share the
/// substrate (file, pool, client) with their parent but never share ids,
/// indexes, or idempotency sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PartitionPath(Vec<String>);

impl PartitionPath {
    pub fn root() -> Self {
        PartitionPath(Vec::new())
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        PartitionPath(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Join segments with an arbitrary separator, for backend key derivation.
    pub fn join(&self, sep: &str) -> String {
        self.0.join(sep)
    }
}

impl std::fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// ── Status machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Completed,
    FailedTemporarily,
    FailedPermanently,
    Stuck,
    Aborted,
    Moved,
    /// Reserved for runner-lock sentinel entries; never used for work items.
    #[serde(rename = "@internal")]
    Internal,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Completed => "completed",
            EntryStatus::FailedTemporarily => "failed_temporarily",
            EntryStatus::FailedPermanently => "failed_permanently",
            EntryStatus::Stuck => "stuck",
            EntryStatus::Aborted => "aborted",
            EntryStatus::Moved => "moved",
            EntryStatus::Internal => "@internal",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "processing" => Ok(EntryStatus::Processing),
            "completed" => Ok(EntryStatus::Completed),
            "failed_temporarily" => Ok(EntryStatus::FailedTemporarily),
            "failed_permanently" => Ok(EntryStatus::FailedPermanently),
            "stuck" => Ok(EntryStatus::Stuck),
            "aborted" => Ok(EntryStatus::Aborted),
            "moved" => Ok(EntryStatus::Moved),
            "@internal" => Ok(EntryStatus::Internal),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }

    /// Statuses that clear `last_error` on entry.
    pub fn clears_error(&self) -> bool {
        matches!(self, EntryStatus::Pending | EntryStatus::Completed)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryStatus::parse(s)
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// One unit of durable queue state.
///
/// The payloads (`request`, `output`) are opaque JSON; encoding and decoding
/// into richer types is the runner's concern, never the store's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    pub request: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: EntryStatus,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub worker: Option<u32>,
    #[serde(default)]
    pub failures: u32,
    #[serde(default)]
    pub idempotent_keys: BTreeSet<String>,
}

impl Entry {
    /// A freshly inserted entry: no output, no error, no worker, zero failures.
    pub fn new(id: EntryId, request: Value, status: EntryStatus) -> Self {
        let now = Utc::now();
        Entry {
            id,
            request,
            output: None,
            last_error: None,
            status,
            created: now,
            updated: now,
            worker: None,
            failures: 0,
            idempotent_keys: BTreeSet::new(),
        }
    }

    /// Apply a status transition and its ancillary effects in one place.
    ///
    /// Callers have already verified any asserted prior status; this only
    /// performs the write-side rules: `worker` is overwritten (even to
    /// none), `updated` advances, `failures` increments on a transition to
    /// `failed_temporarily`, `last_error` clears on `pending`/`completed`
    /// unless the change carries an error, and an explicit output (null
    /// permitted) replaces the stored one.
    pub fn apply_status(&mut self, new_status: EntryStatus, change: &StatusChange) {
        self.status = new_status;
        self.worker = change.by;
        self.updated = Utc::now();
        if new_status == EntryStatus::FailedTemporarily {
            self.failures += 1;
        }
        if new_status.clears_error() {
            self.last_error = None;
        }
        if let Some(error) = &change.error {
            self.last_error = Some(error.clone());
        }
        if let Some(output) = &change.output {
            self.output = Some(output.clone());
        }
    }
}

// ── Operation inputs ─────────────────────────────────────────────────────────

/// Options for `add`: caller-assigned id, initial status, idempotent keys.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub id: Option<EntryId>,
    pub status: Option<EntryStatus>,
    pub idempotent_keys: BTreeSet<String>,
}

impl AddOptions {
    pub fn with_id(id: impl Into<EntryId>) -> Self {
        AddOptions {
            id: Some(id.into()),
            ..AddOptions::default()
        }
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn idempotent_key(mut self, key: impl Into<String>) -> Self {
        self.idempotent_keys.insert(key.into());
        self
    }
}

/// Ancillary data carried by a status transition.
///
/// `output: Some(Value::Null)` stores an explicit null; `None` leaves the
/// stored output untouched.
#[derive(Debug, Clone, Default)]
pub struct StatusChange {
    pub old_status: Option<EntryStatus>,
    pub by: Option<u32>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StatusChange {
    pub fn expecting(old_status: EntryStatus) -> Self {
        StatusChange {
            old_status: Some(old_status),
            ..StatusChange::default()
        }
    }

    pub fn by(mut self, worker: u32) -> Self {
        self.by = Some(worker);
        self
    }

    pub fn output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Query filter; ordering of results is stable per backend but unspecified
/// across backends.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub status: Option<EntryStatus>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EntryFilter {
    pub fn status(status: EntryStatus) -> Self {
        EntryFilter {
            status: Some(status),
            ..EntryFilter::default()
        }
    }

    pub fn updated_before(mut self, before: DateTime<Utc>) -> Self {
        self.updated_before = Some(before);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
