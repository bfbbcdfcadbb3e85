use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use millrace_domain::{
    AddOptions, Entry, EntryFilter, EntryId, EntryStatus, PartitionPath, StatusChange,
};
use rand::Rng;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::store::QueueStore;

// DDL — idempotent; run at every open via migrate().
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS queue_entries (
    id         TEXT NOT NULL,
    path       TEXT NOT NULL,
    request    TEXT NOT NULL,
    output     TEXT,
    last_error TEXT,
    status     TEXT NOT NULL,
    created    TEXT NOT NULL,
    updated    TEXT NOT NULL,
    worker     INTEGER,
    failures   INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (id, path)
);

CREATE TABLE IF NOT EXISTS queue_idempotent_keys (
    entry_id      TEXT NOT NULL,
    idempotent_id TEXT NOT NULL,
    path          TEXT NOT NULL,
    UNIQUE (idempotent_id, path),
    FOREIGN KEY (entry_id, path) REFERENCES queue_entries (id, path)
);

CREATE INDEX IF NOT EXISTS idx_queue_entries_status
    ON queue_entries (path, status);
CREATE INDEX IF NOT EXISTS idx_queue_entries_updated
    ON queue_entries (path, updated);
"#;

const MAX_ATTEMPTS: u32 = 8;
const BASE_DELAY_MS: u64 = 50;
const MAX_DELAY_MS: u64 = 30_000;

/// Marker for optimistic-concurrency conflicts that a fresh transaction
/// resolves: a row that changed between read and conditional write, or an
/// insert that lost a unique-index race.
const CONFLICT: &str = "concurrent queue update conflict";

/// Embedded SQL implementation of [`QueueStore`] backed by a SQLite file.
///
/// Every operation runs in one transaction. `SQLITE_BUSY`/`SQLITE_LOCKED`
/// conditions are retried with exponential backoff plus jitter, sleeps
/// capped at 30 s, and the loop aborts if the instance is destroyed while
/// waiting.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: PartitionPath,
    destroyed: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Open (or create) the database file and run schema migrations.
    pub async fn open(file: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::substrate)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(file)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::substrate)?;
        let store = SqliteStore {
            pool,
            path: PartitionPath::root(),
            destroyed: Arc::new(AtomicBool::new(false)),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Substrate(format!("migration: {e}")))?;
        Ok(())
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed);
        }
        Ok(())
    }

    fn path_key(&self) -> String {
        self.path.to_string()
    }

    async fn backoff(&self, attempt: u32) -> Result<(), StoreError> {
        let exp = BASE_DELAY_MS.saturating_mul(1 << attempt.min(16));
        let capped = exp.min(MAX_DELAY_MS);
        let jitter = rand::thread_rng().gen_range(0..=capped / 2);
        // The cap bounds the whole sleep, jitter included.
        let delay = (capped + jitter).min(MAX_DELAY_MS);
        self.check_alive()?;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.check_alive()
    }

    async fn try_add(&self, request: &Value, opts: &AddOptions) -> Result<EntryId, StoreError> {
        let path = self.path_key();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        if let Some(id) = &opts.id {
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT id FROM queue_entries WHERE id = ? AND path = ?")
                    .bind(id.as_str())
                    .bind(&path)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_err)?;
            if existing.is_some() {
                return Ok(id.clone());
            }
        }

        let mut colliding = BTreeSet::new();
        for key in &opts.idempotent_keys {
            let hit: Option<(String,)> = sqlx::query_as(
                "SELECT idempotent_id FROM queue_idempotent_keys \
                 WHERE idempotent_id = ? AND path = ?",
            )
            .bind(key)
            .bind(&path)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            if hit.is_some() {
                colliding.insert(key.clone());
            }
        }
        if !colliding.is_empty() {
            return Err(StoreError::IdempotentExists { keys: colliding });
        }

        let id = opts.id.clone().unwrap_or_else(EntryId::generate);
        let mut entry = Entry::new(
            id.clone(),
            request.clone(),
            opts.status.unwrap_or(EntryStatus::Pending),
        );
        entry.idempotent_keys = opts.idempotent_keys.clone();

        sqlx::query(
            "INSERT INTO queue_entries \
             (id, path, request, output, last_error, status, created, updated, worker, failures) \
             VALUES (?, ?, ?, NULL, NULL, ?, ?, ?, NULL, 0)",
        )
        .bind(id.as_str())
        .bind(&path)
        .bind(serde_json::to_string(&entry.request)?)
        .bind(entry.status.as_str())
        .bind(timestamp(&entry.created))
        .bind(timestamp(&entry.updated))
        .execute(&mut *tx)
        .await
        .map_err(insert_err)?;

        for key in &entry.idempotent_keys {
            sqlx::query(
                "INSERT INTO queue_idempotent_keys (entry_id, idempotent_id, path) \
                 VALUES (?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(key)
            .bind(&path)
            .execute(&mut *tx)
            .await
            .map_err(insert_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    async fn try_set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: &StatusChange,
    ) -> Result<(), StoreError> {
        let path = self.path_key();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "SELECT request, output, last_error, status, created, updated, worker, failures \
             FROM queue_entries WHERE id = ? AND path = ?",
        )
        .bind(id.as_str())
        .bind(&path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let row = row.ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut entry = entry_from_row(id.clone(), &row)?;
        let read_status = entry.status;
        if let Some(expected) = change.old_status {
            if entry.status != expected {
                return Err(StoreError::IncorrectState {
                    id: id.clone(),
                    expected,
                    actual: entry.status,
                });
            }
        }
        entry.apply_status(new_status, change);

        // The write re-asserts the status we read; under a deferred
        // transaction a peer may have slipped a commit between the read and
        // this write, and a zero-row update sends us around for a re-read.
        let result = sqlx::query(
            "UPDATE queue_entries \
             SET status = ?, output = ?, last_error = ?, updated = ?, worker = ?, failures = ? \
             WHERE id = ? AND path = ? AND status = ?",
        )
        .bind(entry.status.as_str())
        .bind(entry.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&entry.last_error)
        .bind(timestamp(&entry.updated))
        .bind(entry.worker.map(|w| w as i64))
        .bind(entry.failures as i64)
        .bind(id.as_str())
        .bind(&path)
        .bind(read_status.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Substrate(CONFLICT.to_string()));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn keys_for(&self, id: &EntryId) -> Result<BTreeSet<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT idempotent_id FROM queue_idempotent_keys WHERE entry_id = ? AND path = ?",
        )
        .bind(id.as_str())
        .bind(self.path_key())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.check_alive()?;
        let mut attempt = 0;
        loop {
            match self.try_add(&request, &opts).await {
                Err(StoreError::Substrate(msg)) if is_busy(&msg) && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(attempt, "sqlite busy on add, backing off");
                    self.backoff(attempt).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError> {
        self.check_alive()?;
        let mut attempt = 0;
        loop {
            match self.try_set_status(id, new_status, &change).await {
                Err(StoreError::Substrate(msg)) if is_busy(&msg) && attempt < MAX_ATTEMPTS => {
                    tracing::debug!(attempt, "sqlite busy on set_status, backing off");
                    self.backoff(attempt).await?;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.check_alive()?;
        let row = sqlx::query(
            "SELECT request, output, last_error, status, created, updated, worker, failures \
             FROM queue_entries WHERE id = ? AND path = ?",
        )
        .bind(id.as_str())
        .bind(self.path_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => {
                let mut entry = entry_from_row(id.clone(), &row)?;
                entry.idempotent_keys = self.keys_for(id).await?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.check_alive()?;
        let mut sql = String::from(
            "SELECT id, request, output, last_error, status, created, updated, worker, failures \
             FROM queue_entries WHERE path = ?",
        );
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.updated_before.is_some() {
            sql.push_str(" AND updated < ?");
        }
        sql.push_str(" ORDER BY updated ASC, id ASC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(self.path_key());
        if let Some(status) = filter.status {
            q = q.bind(status.as_str());
        }
        if let Some(before) = filter.updated_before {
            q = q.bind(timestamp(&before));
        }
        if let Some(limit) = filter.limit {
            q = q.bind(limit as i64);
        }

        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let id = EntryId::new(row.try_get::<String, _>("id").map_err(db_err)?);
            let mut entry = entry_from_row(id.clone(), &row)?;
            entry.idempotent_keys = self.keys_for(&id).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn partition(&self, segment: &str) -> Arc<dyn QueueStore> {
        Arc::new(SqliteStore {
            pool: self.pool.clone(),
            path: self.path.child(segment),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn maintain(&self) -> Result<(), StoreError> {
        self.check_alive()?;
        sqlx::query("PRAGMA optimize")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// ── Row mapping and retry classification ─────────────────────────────────────

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::Substrate(err.to_string())
}

/// Unique-index losers re-run the whole check-then-insert in a fresh
/// transaction, which then reports the true idempotent/id state.
fn insert_err(err: sqlx::Error) -> StoreError {
    let message = err.to_string();
    if message.contains("UNIQUE constraint failed") {
        StoreError::Substrate(CONFLICT.to_string())
    } else {
        StoreError::Substrate(message)
    }
}

fn is_busy(message: &str) -> bool {
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
        || message.contains(CONFLICT)
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed-width RFC 3339 so lexicographic TEXT comparison matches
    // chronological order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Substrate(format!("bad timestamp {s:?}: {e}")))
}

fn entry_from_row(id: EntryId, row: &sqlx::sqlite::SqliteRow) -> Result<Entry, StoreError> {
    let request: String = row.try_get("request").map_err(db_err)?;
    let output: Option<String> = row.try_get("output").map_err(db_err)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let created: String = row.try_get("created").map_err(db_err)?;
    let updated: String = row.try_get("updated").map_err(db_err)?;
    let worker: Option<i64> = row.try_get("worker").map_err(db_err)?;
    let failures: i64 = row.try_get("failures").map_err(db_err)?;

    Ok(Entry {
        id,
        request: serde_json::from_str(&request)?,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
        last_error,
        status: EntryStatus::parse(&status).map_err(StoreError::substrate)?,
        created: parse_timestamp(&created)?,
        updated: parse_timestamp(&updated)?,
        worker: worker.map(|w| w as u32),
        failures: failures as u32,
        idempotent_keys: BTreeSet::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("queue.db")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn add_get_round_trip() {
        let (_dir, store) = open_temp().await;
        let id = store
            .add(json!({"key": "one"}), AddOptions::default())
            .await
            .unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.request, json!({"key": "one"}));
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.failures, 0);
    }

    #[tokio::test]
    async fn add_is_idempotent_on_id() {
        let (_dir, store) = open_temp().await;
        let id1 = store.add(json!(1), AddOptions::with_id("X")).await.unwrap();
        let id2 = store.add(json!(2), AddOptions::with_id("X")).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.get(&id1).await.unwrap().unwrap().request, json!(1));
    }

    #[tokio::test]
    async fn idempotent_keys_collide_with_reported_subset() {
        let (_dir, store) = open_temp().await;
        store
            .add(json!("a"), AddOptions::with_id("X").idempotent_key("P"))
            .await
            .unwrap();
        let err = store
            .add(
                json!("b"),
                AddOptions::with_id("Y")
                    .idempotent_key("P")
                    .idempotent_key("Q"),
            )
            .await
            .unwrap_err();
        match err {
            StoreError::IdempotentExists { keys } => {
                assert_eq!(keys, BTreeSet::from(["P".to_string()]));
            }
            other => panic!("unexpected error: {other}"),
        }

        let entry = store.get(&EntryId::new("X")).await.unwrap().unwrap();
        assert_eq!(entry.idempotent_keys, BTreeSet::from(["P".to_string()]));
    }

    #[tokio::test]
    async fn set_status_asserts_and_applies_effects() {
        let (_dir, store) = open_temp().await;
        let id = store.add(json!({}), AddOptions::default()).await.unwrap();

        store
            .set_status(
                &id,
                EntryStatus::Processing,
                StatusChange::expecting(EntryStatus::Pending).by(2),
            )
            .await
            .unwrap();
        let err = store
            .set_status(
                &id,
                EntryStatus::Processing,
                StatusChange::expecting(EntryStatus::Pending),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IncorrectState { .. }));

        store
            .set_status(
                &id,
                EntryStatus::FailedTemporarily,
                StatusChange::expecting(EntryStatus::Processing).error("boom"),
            )
            .await
            .unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.failures, 1);
        assert_eq!(entry.last_error.as_deref(), Some("boom"));
        assert_eq!(entry.worker, None);

        store
            .set_status(
                &id,
                EntryStatus::Completed,
                StatusChange::default().output(json!("OK")),
            )
            .await
            .unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.output, Some(json!("OK")));
        assert_eq!(entry.last_error, None);
    }

    #[tokio::test]
    async fn query_by_status_and_limit() {
        let (_dir, store) = open_temp().await;
        for n in 0..3 {
            store.add(json!(n), AddOptions::default()).await.unwrap();
        }
        let pending = store
            .query(EntryFilter::status(EntryStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 3);
        let one = store
            .query(EntryFilter::status(EntryStatus::Pending).limit(1))
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn partitions_do_not_share_ids_or_keys() {
        let (_dir, store) = open_temp().await;
        let fx = store.partition("fx");

        store
            .add(json!("root"), AddOptions::with_id("same").idempotent_key("K"))
            .await
            .unwrap();
        fx.add(json!("fx"), AddOptions::with_id("same").idempotent_key("K"))
            .await
            .unwrap();

        let id = EntryId::new("same");
        assert_eq!(store.get(&id).await.unwrap().unwrap().request, json!("root"));
        assert_eq!(fx.get(&id).await.unwrap().unwrap().request, json!("fx"));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("queue.db");
        {
            let store = SqliteStore::open(&file).await.unwrap();
            store.add(json!(1), AddOptions::with_id("e1")).await.unwrap();
        }
        let store = SqliteStore::open(&file).await.unwrap();
        assert!(store.get(&EntryId::new("e1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn destroyed_instance_rejects_operations() {
        let (_dir, store) = open_temp().await;
        let child = store.partition("fx");
        store.destroy().await.unwrap();
        assert!(matches!(
            store.get(&EntryId::new("x")).await.unwrap_err(),
            StoreError::Destroyed
        ));
        // The issued partition keeps working over the shared pool.
        child.add(json!(1), AddOptions::default()).await.unwrap();
    }
}
