use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use millrace_domain::{
    AddOptions, Entry, EntryFilter, EntryId, EntryStatus, PartitionPath, StatusChange,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::QueueStore;

/// Atomic add: verify the id is free, check idempotent-key collisions,
/// then write the entry hash and index memberships in one step.
///
/// KEYS: 1 entry hash, 2 idempotent-key hash, 3 all-ids zset, 4 status zset.
/// ARGV: 1 id, 2 now in epoch ms, 3 idempotent keys (JSON array),
///       4 entry fields (JSON object of strings).
const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 'exists'
end
local keys = cjson.decode(ARGV[3])
local hits = {}
for i = 1, #keys do
  if redis.call('HEXISTS', KEYS[2], keys[i]) == 1 then
    hits[#hits + 1] = keys[i]
  end
end
if #hits > 0 then
  return 'idem:' .. cjson.encode(hits)
end
local fields = cjson.decode(ARGV[4])
for field, value in pairs(fields) do
  redis.call('HSET', KEYS[1], field, value)
end
redis.call('ZADD', KEYS[3], ARGV[2], ARGV[1])
redis.call('ZADD', KEYS[4], ARGV[2], ARGV[1])
for i = 1, #keys do
  redis.call('HSET', KEYS[2], keys[i], ARGV[1])
end
return 'ok'
"#;

/// Conditional status transition: verify pre-state, then update the entry
/// hash, move the id between status zsets, and apply the ancillary write
/// rules, all in one step.
///
/// KEYS: 1 entry hash, 2 all-ids zset.
/// ARGV: 1 id, 2 expected status ('' = unasserted), 3 new status,
///       4 updated RFC 3339, 5 now in epoch ms, 6 worker ('' = none),
///       7 error text, 8 error present flag, 9 output JSON,
///       10 output present flag, 11 status key prefix.
const SET_STATUS_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], 'status')
if not cur then
  return 'missing'
end
if ARGV[2] ~= '' and cur ~= ARGV[2] then
  return 'state:' .. cur
end
redis.call('ZREM', ARGV[11] .. cur, ARGV[1])
redis.call('ZADD', ARGV[11] .. ARGV[3], ARGV[5], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[5], ARGV[1])
redis.call('HSET', KEYS[1], 'status', ARGV[3], 'updated', ARGV[4])
if ARGV[6] == '' then
  redis.call('HDEL', KEYS[1], 'worker')
else
  redis.call('HSET', KEYS[1], 'worker', ARGV[6])
end
if ARGV[3] == 'failed_temporarily' then
  redis.call('HINCRBY', KEYS[1], 'failures', 1)
end
if ARGV[3] == 'pending' or ARGV[3] == 'completed' then
  redis.call('HDEL', KEYS[1], 'last_error')
end
if ARGV[8] == '1' then
  redis.call('HSET', KEYS[1], 'last_error', ARGV[7])
end
if ARGV[10] == '1' then
  redis.call('HSET', KEYS[1], 'output', ARGV[9])
end
return 'ok'
"#;

struct Scripts {
    add: Script,
    set_status: Script,
}

/// Key-value implementation of [`QueueStore`] backed by Redis.
///
/// Layout under a per-partition prefix: one hash per entry, one sorted set
/// per status (scored by `updated` epoch ms), one sorted set of all ids,
/// and one hash mapping idempotent keys to entry ids. The compound
/// operations are server-side Lua scripts, so their pre-state checks and
/// index updates are atomic.
///
/// Index keys are derived in-script from the partition prefix; this targets
/// single-node or sentinel deployments, not cluster slot hashing.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
    path: PartitionPath,
    scripts: Arc<Scripts>,
    destroyed: Arc<AtomicBool>,
}

impl RedisStore {
    /// Connect with the default `millrace` key namespace.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_namespace(url, "millrace").await
    }

    pub async fn connect_with_namespace(
        url: &str,
        namespace: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Substrate(format!("redis open: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Substrate(format!("redis connect: {e}")))?;
        Ok(RedisStore {
            conn,
            namespace: namespace.into(),
            path: PartitionPath::root(),
            scripts: Arc::new(Scripts {
                add: Script::new(ADD_SCRIPT),
                set_status: Script::new(SET_STATUS_SCRIPT),
            }),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed);
        }
        Ok(())
    }

    fn base(&self) -> String {
        if self.path.is_root() {
            self.namespace.clone()
        } else {
            format!("{}:{}", self.namespace, self.path.join(":"))
        }
    }

    fn entry_key(&self, id: &EntryId) -> String {
        format!("{}:entry:{}", self.base(), id)
    }

    fn status_prefix(&self) -> String {
        format!("{}:status:", self.base())
    }

    fn status_key(&self, status: EntryStatus) -> String {
        format!("{}{}", self.status_prefix(), status)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.base())
    }

    fn idem_key(&self) -> String {
        format!("{}:idem", self.base())
    }

    async fn fetch(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(self.entry_key(id))
            .await
            .map_err(db_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        entry_from_hash(id.clone(), &fields).map(Some)
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.check_alive()?;
        let id = opts.id.clone().unwrap_or_else(EntryId::generate);
        let mut entry = Entry::new(
            id.clone(),
            request,
            opts.status.unwrap_or(EntryStatus::Pending),
        );
        entry.idempotent_keys = opts.idempotent_keys;

        let keys_json = serde_json::to_string(&entry.idempotent_keys)?;
        let fields = hash_from_entry(&entry)?;
        let fields_json = serde_json::to_string(&fields)?;

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .add
            .key(self.entry_key(&id))
            .key(self.idem_key())
            .key(self.ids_key())
            .key(self.status_key(entry.status))
            .arg(id.as_str())
            .arg(entry.updated.timestamp_millis())
            .arg(keys_json)
            .arg(fields_json)
            .invoke_async(&mut conn)
            .await
            .map_err(db_err)?;

        match outcome.as_str() {
            "ok" | "exists" => Ok(id),
            other => match other.strip_prefix("idem:") {
                Some(json) => {
                    let keys: BTreeSet<String> = serde_json::from_str(json)?;
                    Err(StoreError::IdempotentExists { keys })
                }
                None => Err(StoreError::Substrate(format!(
                    "unexpected add script reply: {other}"
                ))),
            },
        }
    }

    async fn set_status(
        &self,
        id: &EntryId,
        new_status: EntryStatus,
        change: StatusChange,
    ) -> Result<(), StoreError> {
        self.check_alive()?;
        let now = Utc::now();
        let output_json = match &change.output {
            Some(value) => serde_json::to_string(value)?,
            None => String::new(),
        };

        let mut conn = self.conn.clone();
        let outcome: String = self
            .scripts
            .set_status
            .key(self.entry_key(id))
            .key(self.ids_key())
            .arg(id.as_str())
            .arg(change.old_status.map(|s| s.as_str()).unwrap_or(""))
            .arg(new_status.as_str())
            .arg(timestamp(&now))
            .arg(now.timestamp_millis())
            .arg(change.by.map(|w| w.to_string()).unwrap_or_default())
            .arg(change.error.clone().unwrap_or_default())
            .arg(if change.error.is_some() { "1" } else { "0" })
            .arg(output_json)
            .arg(if change.output.is_some() { "1" } else { "0" })
            .arg(self.status_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(db_err)?;

        match outcome.as_str() {
            "ok" => Ok(()),
            "missing" => Err(StoreError::NotFound(id.clone())),
            other => match other.strip_prefix("state:") {
                Some(actual) => Err(StoreError::IncorrectState {
                    id: id.clone(),
                    // Unasserted transitions never take this branch.
                    expected: change.old_status.unwrap_or(new_status),
                    actual: EntryStatus::parse(actual).map_err(StoreError::substrate)?,
                }),
                None => Err(StoreError::Substrate(format!(
                    "unexpected set_status script reply: {other}"
                ))),
            },
        }
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.check_alive()?;
        self.fetch(id).await
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.check_alive()?;
        let index = match filter.status {
            Some(status) => self.status_key(status),
            None => self.ids_key(),
        };
        let max = match filter.updated_before {
            // Exclusive upper bound on the updated-ms score.
            Some(before) => format!("({}", before.timestamp_millis()),
            None => "+inf".to_string(),
        };
        let count = filter.limit.map(|l| l as isize).unwrap_or(-1);

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .zrangebyscore_limit(index, "-inf", max, 0, count)
            .await
            .map_err(db_err)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            // The index can briefly lead the entry hash; skip dangling ids.
            if let Some(entry) = self.fetch(&EntryId::new(id)).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn partition(&self, segment: &str) -> Arc<dyn QueueStore> {
        Arc::new(RedisStore {
            conn: self.conn.clone(),
            namespace: self.namespace.clone(),
            path: self.path.child(segment),
            scripts: Arc::clone(&self.scripts),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Hash mapping ─────────────────────────────────────────────────────────────

fn db_err(err: redis::RedisError) -> StoreError {
    StoreError::Substrate(err.to_string())
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Substrate(format!("bad timestamp {s:?}: {e}")))
}

fn hash_from_entry(entry: &Entry) -> Result<HashMap<String, String>, StoreError> {
    let mut fields = HashMap::from([
        ("request".to_string(), serde_json::to_string(&entry.request)?),
        ("status".to_string(), entry.status.as_str().to_string()),
        ("created".to_string(), timestamp(&entry.created)),
        ("updated".to_string(), timestamp(&entry.updated)),
        ("failures".to_string(), entry.failures.to_string()),
        (
            "idem".to_string(),
            serde_json::to_string(&entry.idempotent_keys)?,
        ),
    ]);
    if let Some(output) = &entry.output {
        fields.insert("output".to_string(), serde_json::to_string(output)?);
    }
    if let Some(error) = &entry.last_error {
        fields.insert("last_error".to_string(), error.clone());
    }
    if let Some(worker) = entry.worker {
        fields.insert("worker".to_string(), worker.to_string());
    }
    Ok(fields)
}

fn entry_from_hash(id: EntryId, fields: &HashMap<String, String>) -> Result<Entry, StoreError> {
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| StoreError::Substrate(format!("entry hash missing field {name}")))
    };
    Ok(Entry {
        request: serde_json::from_str(field("request")?)?,
        output: fields
            .get("output")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?,
        last_error: fields.get("last_error").cloned(),
        status: EntryStatus::parse(field("status")?).map_err(StoreError::substrate)?,
        created: parse_timestamp(field("created")?)?,
        updated: parse_timestamp(field("updated")?)?,
        worker: fields
            .get("worker")
            .map(|w| {
                w.parse::<u32>()
                    .map_err(|e| StoreError::Substrate(format!("bad worker {w:?}: {e}")))
            })
            .transpose()?,
        failures: field("failures")?
            .parse::<u32>()
            .map_err(|e| StoreError::Substrate(format!("bad failures: {e}")))?,
        idempotent_keys: serde_json::from_str(field("idem")?)?,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_url() -> Option<String> {
        std::env::var("TEST_REDIS_URL").ok()
    }

    #[test]
    fn hash_round_trip() {
        let mut entry = Entry::new(
            EntryId::new("e1"),
            json!({"key": "one"}),
            EntryStatus::Pending,
        );
        entry.output = Some(json!("OK"));
        entry.last_error = Some("boom".into());
        entry.worker = Some(3);
        entry.failures = 2;
        entry.idempotent_keys.insert("P".into());

        let fields = hash_from_entry(&entry).unwrap();
        let back = entry_from_hash(EntryId::new("e1"), &fields).unwrap();
        assert_eq!(back.request, entry.request);
        assert_eq!(back.output, entry.output);
        assert_eq!(back.last_error, entry.last_error);
        assert_eq!(back.worker, entry.worker);
        assert_eq!(back.failures, entry.failures);
        assert_eq!(back.idempotent_keys, entry.idempotent_keys);
    }

    #[tokio::test]
    #[ignore = "requires TEST_REDIS_URL"]
    async fn contract_round_trip() {
        let url = test_url().unwrap();
        let store = RedisStore::connect_with_namespace(&url, format!("t-{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();

        let id = store
            .add(json!({"key": "one"}), AddOptions::default())
            .await
            .unwrap();
        store
            .set_status(
                &id,
                EntryStatus::Processing,
                StatusChange::expecting(EntryStatus::Pending).by(0),
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
                EntryStatus::Completed,
                StatusChange::expecting(EntryStatus::Processing).output(json!("OK")),
            )
            .await
            .unwrap();
        let entry = store.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.output, Some(json!("OK")));

        let completed = store
            .query(EntryFilter::status(EntryStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    #[ignore = "requires TEST_REDIS_URL"]
    async fn idempotent_keys_collide() {
        let url = test_url().unwrap();
        let store = RedisStore::connect_with_namespace(&url, format!("t-{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();

        store
            .add(json!(1), AddOptions::with_id("a").idempotent_key("P"))
            .await
            .unwrap();
        let err = store
            .add(
                json!(2),
                AddOptions::with_id("b")
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
    }
}
