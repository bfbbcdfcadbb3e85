use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use millrace_domain::{
    AddOptions, Entry, EntryFilter, EntryId, EntryStatus, PartitionPath, StatusChange,
};
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{FindOptions, IndexOptions};
use mongodb::{Client, ClientSession, Collection, Database, IndexModel};
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::StoreError;
use crate::store::QueueStore;

/// Document-store implementation of [`QueueStore`] backed by MongoDB.
///
/// Each partition owns an entry collection and an idempotent-key collection
/// (unique index on the key). Every compound operation runs its reads and
/// writes inside one client-session transaction; aborts are best-effort and
/// their errors swallowed so the primary failure surfaces. Requires a
/// replica-set or sharded deployment, as MongoDB transactions do.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
    path: PartitionPath,
    indexes: Arc<OnceCell<()>>,
    destroyed: Arc<AtomicBool>,
}

impl MongoStore {
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Substrate(format!("mongodb connect: {e}")))?;
        let db = client.database(db_name);
        Ok(MongoStore {
            client,
            db,
            path: PartitionPath::root(),
            indexes: Arc::new(OnceCell::new()),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed);
        }
        Ok(())
    }

    fn suffix(&self) -> String {
        if self.path.is_root() {
            String::new()
        } else {
            format!("_{}", self.path.join("_"))
        }
    }

    fn entries(&self) -> Collection<Document> {
        self.db
            .collection(&format!("queue_entries{}", self.suffix()))
    }

    fn keys(&self) -> Collection<Document> {
        self.db
            .collection(&format!("queue_idempotent_keys{}", self.suffix()))
    }

    /// Collection indexes, created once per instance before the first write.
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.indexes
            .get_or_try_init(|| async {
                self.entries()
                    .create_index(
                        IndexModel::builder().keys(doc! { "status": 1 }).build(),
                        None,
                    )
                    .await
                    .map_err(db_err)?;
                self.entries()
                    .create_index(
                        IndexModel::builder().keys(doc! { "updated": 1 }).build(),
                        None,
                    )
                    .await
                    .map_err(db_err)?;
                self.keys()
                    .create_index(
                        IndexModel::builder()
                            .keys(doc! { "key": 1 })
                            .options(IndexOptions::builder().unique(true).build())
                            .build(),
                        None,
                    )
                    .await
                    .map_err(db_err)?;
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    async fn try_add(
        &self,
        session: &mut ClientSession,
        request: &Value,
        opts: &AddOptions,
    ) -> Result<EntryId, StoreError> {
        if let Some(id) = &opts.id {
            let existing = self
                .entries()
                .find_one_with_session(doc! { "_id": id.as_str() }, None, session)
                .await
                .map_err(db_err)?;
            if existing.is_some() {
                return Ok(id.clone());
            }
        }

        if !opts.idempotent_keys.is_empty() {
            let wanted: Vec<&str> = opts.idempotent_keys.iter().map(String::as_str).collect();
            let mut cursor = self
                .keys()
                .find_with_session(doc! { "key": { "$in": wanted } }, None, session)
                .await
                .map_err(db_err)?;
            let mut colliding = BTreeSet::new();
            while cursor.advance(session).await.map_err(db_err)? {
                let hit = cursor.deserialize_current().map_err(db_err)?;
                if let Ok(key) = hit.get_str("key") {
                    colliding.insert(key.to_string());
                }
            }
            if !colliding.is_empty() {
                return Err(StoreError::IdempotentExists { keys: colliding });
            }
        }

        let id = opts.id.clone().unwrap_or_else(EntryId::generate);
        let mut entry = Entry::new(
            id.clone(),
            request.clone(),
            opts.status.unwrap_or(EntryStatus::Pending),
        );
        entry.idempotent_keys = opts.idempotent_keys.clone();

        self.entries()
            .insert_one_with_session(entry_to_doc(&entry)?, None, session)
            .await
            .map_err(db_err)?;
        for key in &entry.idempotent_keys {
            self.keys()
                .insert_one_with_session(
                    doc! { "key": key.as_str(), "entryId": id.as_str() },
                    None,
                    session,
                )
                .await
                .map_err(db_err)?;
        }
        Ok(id)
    }

    async fn try_set_status(
        &self,
        session: &mut ClientSession,
        id: &EntryId,
        new_status: EntryStatus,
        change: &StatusChange,
    ) -> Result<(), StoreError> {
        let found = self
            .entries()
            .find_one_with_session(doc! { "_id": id.as_str() }, None, session)
            .await
            .map_err(db_err)?;
        let found = found.ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let mut entry = doc_to_entry(&found)?;
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

        self.entries()
            .replace_one_with_session(
                doc! { "_id": id.as_str() },
                entry_to_doc(&entry)?,
                None,
                session,
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn start(&self) -> Result<ClientSession, StoreError> {
        let mut session = self.client.start_session(None).await.map_err(db_err)?;
        session.start_transaction(None).await.map_err(db_err)?;
        Ok(session)
    }
}

#[async_trait]
impl QueueStore for MongoStore {
    async fn add(&self, request: Value, opts: AddOptions) -> Result<EntryId, StoreError> {
        self.check_alive()?;
        self.ensure_indexes().await?;
        let mut session = self.start().await?;
        match self.try_add(&mut session, &request, &opts).await {
            Ok(id) => {
                session.commit_transaction().await.map_err(db_err)?;
                Ok(id)
            }
            Err(err) => {
                // Best-effort abort; the primary failure is the one surfaced.
                let _ = session.abort_transaction().await;
                Err(err)
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
        self.ensure_indexes().await?;
        let mut session = self.start().await?;
        match self.try_set_status(&mut session, id, new_status, &change).await {
            Ok(()) => {
                session.commit_transaction().await.map_err(db_err)?;
                Ok(())
            }
            Err(err) => {
                let _ = session.abort_transaction().await;
                Err(err)
            }
        }
    }

    async fn get(&self, id: &EntryId) -> Result<Option<Entry>, StoreError> {
        self.check_alive()?;
        let found = self
            .entries()
            .find_one(doc! { "_id": id.as_str() }, None)
            .await
            .map_err(db_err)?;
        found.as_ref().map(doc_to_entry).transpose()
    }

    async fn query(&self, filter: EntryFilter) -> Result<Vec<Entry>, StoreError> {
        self.check_alive()?;
        let mut query = Document::new();
        if let Some(status) = filter.status {
            query.insert("status", status.as_str());
        }
        if let Some(before) = filter.updated_before {
            query.insert("updated", doc! { "$lt": to_bson_datetime(&before) });
        }
        let options = FindOptions::builder()
            .sort(doc! { "updated": 1, "_id": 1 })
            .limit(filter.limit.map(|l| l as i64))
            .build();

        let mut cursor = self
            .entries()
            .find(query, options)
            .await
            .map_err(db_err)?;
        let mut entries = Vec::new();
        while cursor.advance().await.map_err(db_err)? {
            let document = cursor.deserialize_current().map_err(db_err)?;
            entries.push(doc_to_entry(&document)?);
        }
        Ok(entries)
    }

    fn partition(&self, segment: &str) -> Arc<dyn QueueStore> {
        Arc::new(MongoStore {
            client: self.client.clone(),
            db: self.db.clone(),
            path: self.path.child(segment),
            indexes: Arc::new(OnceCell::new()),
            destroyed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Document mapping ─────────────────────────────────────────────────────────

fn db_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Substrate(err.to_string())
}

fn to_bson_datetime(at: &DateTime<Utc>) -> mongodb::bson::DateTime {
    mongodb::bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_datetime(at: mongodb::bson::DateTime) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(at.timestamp_millis())
        .single()
        .ok_or_else(|| StoreError::Substrate(format!("bad stored timestamp: {at}")))
}

fn json_to_bson(value: &Value) -> Result<Bson, StoreError> {
    mongodb::bson::to_bson(value).map_err(StoreError::substrate)
}

fn bson_to_json(value: &Bson) -> Result<Value, StoreError> {
    mongodb::bson::from_bson(value.clone()).map_err(StoreError::substrate)
}

fn entry_to_doc(entry: &Entry) -> Result<Document, StoreError> {
    let mut document = doc! {
        "_id": entry.id.as_str(),
        "request": json_to_bson(&entry.request)?,
        "status": entry.status.as_str(),
        "created": to_bson_datetime(&entry.created),
        "updated": to_bson_datetime(&entry.updated),
        "failures": entry.failures as i64,
        "idempotentKeys": entry.idempotent_keys.iter().map(String::as_str).collect::<Vec<_>>(),
    };
    if let Some(output) = &entry.output {
        document.insert("output", json_to_bson(output)?);
    }
    if let Some(error) = &entry.last_error {
        document.insert("lastError", error.clone());
    }
    if let Some(worker) = entry.worker {
        document.insert("worker", worker as i64);
    }
    Ok(document)
}

fn doc_to_entry(document: &Document) -> Result<Entry, StoreError> {
    let id = document.get_str("_id").map_err(db_err)?;
    let status = document.get_str("status").map_err(db_err)?;
    let mut idempotent_keys = BTreeSet::new();
    if let Ok(keys) = document.get_array("idempotentKeys") {
        for key in keys {
            if let Bson::String(key) = key {
                idempotent_keys.insert(key.clone());
            }
        }
    }
    Ok(Entry {
        id: EntryId::new(id),
        request: bson_to_json(document.get("request").unwrap_or(&Bson::Null))?,
        output: document.get("output").map(bson_to_json).transpose()?,
        last_error: document.get_str("lastError").ok().map(str::to_string),
        status: EntryStatus::parse(status).map_err(StoreError::substrate)?,
        created: from_bson_datetime(*document.get_datetime("created").map_err(db_err)?)?,
        updated: from_bson_datetime(*document.get_datetime("updated").map_err(db_err)?)?,
        worker: document.get_i64("worker").ok().map(|w| w as u32),
        failures: document.get_i64("failures").map_err(db_err)? as u32,
        idempotent_keys,
    })
}
