//! # Chunk Retraction
//!
//! Removes one analysis chunk from a rolling dataset. Documents written only
//! by the chunk are deleted whole; documents that later chunks also touched
//! keep everything except the chunk's entries in their history array.

use crate::config::defaults::{DEFAULT_HISTORY_FIELD, DEFAULT_RETRACTION_WORKERS, DEFAULT_TAG_FIELD};
use crate::document::{ChunkId, Document};
use crate::error::Closed;
use crate::gateway::Database;
use crate::pipeline::WorkerPool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Configuration for chunk retraction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetractionConfig {
    /// Field naming the chunk that last wrote a document
    pub tag_field: String,
    /// Array of per-chunk entries, each carrying `tag_field`
    pub history_field: String,
    pub workers: usize,
}

impl Default for RetractionConfig {
    fn default() -> Self {
        Self {
            tag_field: DEFAULT_TAG_FIELD.to_string(),
            history_field: DEFAULT_HISTORY_FIELD.to_string(),
            workers: DEFAULT_RETRACTION_WORKERS,
        }
    }
}

/// One `update_many` issued by a [`ChunkUpdater`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryUpdate {
    pub collection: String,
    pub selector: Document,
    pub update: Document,
}

impl HistoryUpdate {
    pub fn new(collection: impl Into<String>, selector: Document, update: Document) -> Self {
        Self {
            collection: collection.into(),
            selector,
            update,
        }
    }

    /// Pull every history entry of `chunk` from the documents holding one.
    pub fn trim_chunk(collection: impl Into<String>, config: &RetractionConfig, chunk: ChunkId) -> Self {
        let entry_tag = format!("{}.{}", config.history_field, config.tag_field);

        let mut selector = Document::new();
        selector.insert(entry_tag, Value::from(chunk));

        let mut entry = Document::new();
        entry.insert(config.tag_field.clone(), Value::from(chunk));
        let mut pull = Document::new();
        pull.insert(config.history_field.clone(), Value::Object(entry));
        let mut update = Document::new();
        update.insert("$pull".into(), Value::Object(pull));

        Self::new(collection, selector, update)
    }
}

/// Totals of one retraction session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetractionReport {
    /// Collection names or updates processed
    pub items: u64,
    pub documents_deleted: u64,
    pub documents_trimmed: u64,
    pub updates_applied: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct RetractionCounters {
    items: AtomicU64,
    documents_deleted: AtomicU64,
    documents_trimmed: AtomicU64,
    updates_applied: AtomicU64,
    failures: AtomicU64,
}

impl RetractionCounters {
    fn snapshot(&self) -> RetractionReport {
        RetractionReport {
            items: self.items.load(Ordering::Relaxed),
            documents_deleted: self.documents_deleted.load(Ordering::Relaxed),
            documents_trimmed: self.documents_trimmed.load(Ordering::Relaxed),
            updates_applied: self.updates_applied.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Removes one chunk from every collection it is given.
pub struct ChunkRemover {
    chunk: ChunkId,
    pool: WorkerPool<String>,
    counters: Arc<RetractionCounters>,
}

impl ChunkRemover {
    pub fn start(database: &Database, chunk: ChunkId, config: &RetractionConfig) -> std::io::Result<Self> {
        let counters = Arc::new(RetractionCounters::default());
        let worker_counters = Arc::clone(&counters);
        let worker_database = database.clone();
        let worker_config = config.clone();

        let pool = WorkerPool::spawn("chunk-remover", config.workers, 0, move |name: String| {
            remove_chunk(&worker_database, &worker_config, chunk, &name, &worker_counters);
        })?;

        Ok(Self {
            chunk,
            pool,
            counters,
        })
    }

    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Queue a collection for retraction.
    pub fn collect(&self, collection: impl Into<String>) -> Result<(), Closed> {
        self.pool.send(collection.into())
    }

    pub fn close(&self) -> RetractionReport {
        if self.pool.close() {
            let report = self.counters.snapshot();
            info!(
                chunk = self.chunk.0,
                collections = report.items,
                deleted = report.documents_deleted,
                trimmed = report.documents_trimmed,
                failures = report.failures,
                "Removed chunk"
            );
        }
        self.counters.snapshot()
    }
}

impl Drop for ChunkRemover {
    fn drop(&mut self) {
        self.close();
    }
}

fn remove_chunk(
    database: &Database,
    config: &RetractionConfig,
    chunk: ChunkId,
    name: &str,
    counters: &RetractionCounters,
) {
    counters.items.fetch_add(1, Ordering::Relaxed);
    let collection = database.collection(name);

    // documents last written by the chunk go entirely
    let mut whole = Document::new();
    whole.insert(config.tag_field.clone(), Value::from(chunk));
    match collection.delete_many(&whole) {
        Ok(result) => {
            counters
                .documents_deleted
                .fetch_add(result.deleted, Ordering::Relaxed);
            if result.deleted == 0 {
                debug!(chunk = chunk.0, collection = name, "No documents left solely by chunk");
            }
        }
        Err(err) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(chunk = chunk.0, collection = name, error = %err, "Failed to delete whole documents");
        }
    }

    // the rest only lose the chunk's history entries
    let trim = HistoryUpdate::trim_chunk(name, config, chunk);
    match collection.update_many(&trim.selector, &trim.update) {
        Ok(result) => {
            counters
                .documents_trimmed
                .fetch_add(result.modified, Ordering::Relaxed);
            if result.matched != 0 && result.modified == 0 && result.upserted == 0 {
                warn!(
                    chunk = chunk.0,
                    collection = name,
                    matched = result.matched,
                    "Matched documents kept their chunk history"
                );
            }
        }
        Err(err) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            error!(chunk = chunk.0, collection = name, error = %err, "Failed to trim chunk history");
        }
    }
}

/// Applies arbitrary history updates, one `update_many` per item.
pub struct ChunkUpdater {
    pool: WorkerPool<HistoryUpdate>,
    counters: Arc<RetractionCounters>,
}

impl ChunkUpdater {
    pub fn start(database: &Database, config: &RetractionConfig) -> std::io::Result<Self> {
        let counters = Arc::new(RetractionCounters::default());
        let worker_counters = Arc::clone(&counters);
        let worker_database = database.clone();

        let pool = WorkerPool::spawn("chunk-updater", config.workers, 0, move |item: HistoryUpdate| {
            worker_counters.items.fetch_add(1, Ordering::Relaxed);
            let collection = worker_database.collection(item.collection.as_str());
            match collection.update_many(&item.selector, &item.update) {
                Ok(result) => {
                    worker_counters.updates_applied.fetch_add(1, Ordering::Relaxed);
                    worker_counters
                        .documents_trimmed
                        .fetch_add(result.modified, Ordering::Relaxed);
                }
                Err(err) => {
                    worker_counters.failures.fetch_add(1, Ordering::Relaxed);
                    let selector = Value::Object(item.selector.clone());
                    error!(
                        collection = %item.collection,
                        selector = %selector,
                        error = %err,
                        "Failed history update"
                    );
                }
            }
        })?;

        Ok(Self { pool, counters })
    }

    pub fn collect(&self, update: HistoryUpdate) -> Result<(), Closed> {
        self.pool.send(update)
    }

    pub fn close(&self) -> RetractionReport {
        if self.pool.close() {
            let report = self.counters.snapshot();
            info!(
                updates = report.updates_applied,
                modified = report.documents_trimmed,
                failures = report.failures,
                "Closed chunk updater"
            );
        }
        self.counters.snapshot()
    }
}

impl Drop for ChunkUpdater {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use crate::error::StoreError;
    use crate::gateway::StoreGateway;
    use crate::memory::MemoryStore;
    use serde_json::json;

    const DB: &str = "rolling";

    fn setup() -> (Arc<MemoryStore>, Database) {
        let store = Arc::new(MemoryStore::new());
        let database = StoreGateway::from_shared(store.clone()).select_database(DB);
        (store, database)
    }

    #[test]
    fn test_trim_chunk_builds_pull() {
        let update = HistoryUpdate::trim_chunk("host", &RetractionConfig::default(), ChunkId(5));
        assert_eq!(update.collection, "host");
        assert_eq!(update.selector, document! { "dat.cid": 5 });
        assert_eq!(update.update, document! { "$pull": { "dat": { "cid": 5 } } });

        let custom = RetractionConfig {
            tag_field: "chunk".into(),
            history_field: "history".into(),
            workers: 1,
        };
        let update = HistoryUpdate::trim_chunk("host", &custom, ChunkId(1));
        assert_eq!(update.selector, document! { "history.chunk": 1 });
    }

    #[test]
    fn test_remover_deletes_and_trims() {
        let (store, db) = setup();
        store
            .insert_many(
                DB,
                "host",
                [
                    document! { "ip": "a", "cid": 2, "dat": [{ "cid": 2, "n": 1 }] },
                    document! { "ip": "b", "cid": 3, "dat": [{ "cid": 2, "n": 1 }, { "cid": 3, "n": 4 }] },
                    document! { "ip": "c", "cid": 3, "dat": [{ "cid": 3, "n": 2 }] },
                ],
            )
            .unwrap();

        let remover = ChunkRemover::start(&db, ChunkId(2), &RetractionConfig::default()).unwrap();
        remover.collect("host").unwrap();
        remover.collect("empty").unwrap();
        let report = remover.close();

        assert_eq!(report.items, 2);
        assert_eq!(report.documents_deleted, 1);
        assert_eq!(report.documents_trimmed, 1);
        assert_eq!(report.failures, 0);

        let docs = store.documents(DB, "host");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["dat"], json!([{ "cid": 3, "n": 4 }]));
        assert_eq!(docs[1]["dat"], json!([{ "cid": 3, "n": 2 }]));
        assert!(remover.collect("late").is_err());
    }

    #[test]
    fn test_remover_counts_failures_and_continues() {
        let (store, db) = setup();
        store.inject_fault(DB, "broken", StoreError::Backend("timeout".into()));
        store
            .insert_many(DB, "host", [document! { "ip": "a", "cid": 1 }])
            .unwrap();

        let remover = ChunkRemover::start(&db, ChunkId(1), &RetractionConfig::default()).unwrap();
        remover.collect("broken").unwrap();
        remover.collect("host").unwrap();
        let report = remover.close();
        assert_eq!(report.failures, 2);
        assert_eq!(report.documents_deleted, 1);
        assert!(store.documents(DB, "host").is_empty());
    }

    #[test]
    fn test_updater_applies_history_updates() {
        let (store, db) = setup();
        store
            .insert_many(DB, "uconn", [document! { "src": "a", "dat": [{ "cid": 1 }, { "cid": 2 }] }])
            .unwrap();

        let updater = ChunkUpdater::start(&db, &RetractionConfig::default()).unwrap();
        updater
            .collect(HistoryUpdate::trim_chunk("uconn", &RetractionConfig::default(), ChunkId(1)))
            .unwrap();
        updater
            .collect(HistoryUpdate::new(
                "uconn",
                document! { "src": "a" },
                document! { "$set": { "cid": 2 } },
            ))
            .unwrap();
        let report = updater.close();

        assert_eq!(report.items, 2);
        assert_eq!(report.updates_applied, 2);
        let doc = &store.documents(DB, "uconn")[0];
        assert_eq!(doc["dat"], json!([{ "cid": 2 }]));
        assert_eq!(doc["cid"], json!(2));
    }

    #[test]
    fn test_updater_counts_failed_items_and_continues() {
        let (store, db) = setup();
        store.inject_fault(DB, "broken", StoreError::Backend("not primary".into()));
        store
            .insert_many(DB, "uconn", [document! { "src": "a", "dat": [{ "cid": 1 }] }])
            .unwrap();

        let updater = ChunkUpdater::start(&db, &RetractionConfig::default()).unwrap();
        updater
            .collect(HistoryUpdate::trim_chunk("broken", &RetractionConfig::default(), ChunkId(1)))
            .unwrap();
        updater
            .collect(HistoryUpdate::trim_chunk("uconn", &RetractionConfig::default(), ChunkId(1)))
            .unwrap();
        let report = updater.close();

        assert_eq!(report.items, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(report.updates_applied, 1);
        assert_eq!(store.documents(DB, "uconn")[0]["dat"], json!([]));
    }
}
