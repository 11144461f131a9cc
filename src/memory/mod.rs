//! # In-Memory Store
//!
//! A process-local [`DocumentStore`] with the query, update and bulk-write
//! semantics the write path relies on. Used to embed the pipeline without a
//! server and as the backend of the test suite, where its fault injection
//! and bulk call log make writer behaviour observable.
//!
//! This is a test and embedding backend only. It is not part of the write
//! path's contract, which ends at the [`DocumentStore`] trait; production
//! deployments plug in a client for a real document store instead. The
//! operator coverage is the subset the write path and its tests issue, not
//! a general query engine.

mod aggregate;
mod filter;
mod update;

pub use aggregate::run_pipeline;
pub use filter::matches;
pub use update::{apply_update, upsert_seed};

use crate::change::{Change, ChangeMode};
use crate::config::defaults::STORE_PAYLOAD_LIMIT;
use crate::document::{lookup_path, values_equal, Document};
use crate::error::StoreError;
use crate::gateway::{
    AggregateOptions, BulkWriteFailure, BulkWriteOptions, BulkWriteResult, Cursor, DeleteResult,
    DocumentStore, IndexSpec, UpdateResult,
};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Bytes a bulk operation adds around its selector and payload on the wire
/// (operation type, flags and field names).
pub const OPERATION_ENVELOPE: usize = 32;

/// One `bulk_write` call observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkCall {
    pub database: String,
    pub collection: String,
    pub operations: usize,
    pub ordered: bool,
}

#[derive(Debug, Default)]
struct CollectionState {
    documents: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

#[derive(Debug, Default)]
struct Faults {
    /// Every operation on the collection fails with the error.
    operations: HashMap<(String, String), StoreError>,
    /// Aggregations return a cursor that fails after its first documents.
    cursors: HashMap<(String, String), StoreError>,
    /// Collection listing fails for the database.
    listing: HashMap<String, StoreError>,
}

/// Per-document outcome of one change.
#[derive(Debug, Default)]
struct Applied {
    matched: u64,
    modified: u64,
    upserted: u64,
    deleted: u64,
}

/// Process-local document store.
#[derive(Debug)]
pub struct MemoryStore {
    databases: RwLock<HashMap<String, HashMap<String, CollectionState>>>,
    faults: Mutex<Faults>,
    bulk_log: Mutex<Vec<BulkCall>>,
    next_id: AtomicU64,
    payload_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_payload_limit(STORE_PAYLOAD_LIMIT)
    }

    /// Store whose per-operation payload ceiling is `limit` bytes.
    pub fn with_payload_limit(limit: usize) -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            faults: Mutex::new(Faults::default()),
            bulk_log: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            payload_limit: limit,
        }
    }

    pub fn payload_limit(&self) -> usize {
        self.payload_limit
    }

    /// Make every operation on `collection` fail with `error`.
    pub fn inject_fault(&self, database: &str, collection: &str, error: StoreError) {
        self.faults
            .lock()
            .operations
            .insert((database.to_string(), collection.to_string()), error);
    }

    /// Make aggregations on `collection` yield a cursor that fails with `error`.
    pub fn inject_cursor_fault(&self, database: &str, collection: &str, error: StoreError) {
        self.faults
            .lock()
            .cursors
            .insert((database.to_string(), collection.to_string()), error);
    }

    /// Make listing the collections of `database` fail with `error`.
    pub fn inject_listing_fault(&self, database: &str, error: StoreError) {
        self.faults.lock().listing.insert(database.to_string(), error);
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Every bulk call received so far, oldest first.
    pub fn bulk_calls(&self) -> Vec<BulkCall> {
        self.bulk_log.lock().clone()
    }

    /// Snapshot of the documents of a collection, in insertion order.
    pub fn documents(&self, database: &str, collection: &str) -> Vec<Document> {
        self.databases
            .read()
            .get(database)
            .and_then(|collections| collections.get(collection))
            .map(|state| state.documents.clone())
            .unwrap_or_default()
    }

    /// Documents of a collection matching `filter`.
    pub fn find(&self, database: &str, collection: &str, filter: &Document) -> Result<Vec<Document>, StoreError> {
        let mut found = Vec::new();
        for doc in self.documents(database, collection) {
            if matches(&doc, filter)? {
                found.push(doc);
            }
        }
        Ok(found)
    }

    /// Insert documents directly, assigning `_id` where missing. Unique
    /// indexes are enforced.
    pub fn insert_many<I>(&self, database: &str, collection: &str, docs: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = Document>,
    {
        let mut databases = self.databases.write();
        let state = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        let mut inserted = 0;
        for mut doc in docs {
            self.assign_id(&mut doc);
            check_unique(collection, state, &doc, None)?;
            state.documents.push(doc);
            inserted += 1;
        }
        Ok(inserted)
    }

    fn assign_id(&self, doc: &mut Document) {
        if !doc.contains_key("_id") {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            doc.insert("_id".into(), Value::from(id));
        }
    }

    fn check_fault(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        let faults = self.faults.lock();
        match faults
            .operations
            .get(&(database.to_string(), collection.to_string()))
        {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn apply_change(
        &self,
        collection: &str,
        state: &mut CollectionState,
        change: &Change,
    ) -> Result<Applied, StoreError> {
        let size = change.encoded_len() + OPERATION_ENVELOPE;
        if size > self.payload_limit {
            return Err(StoreError::PayloadTooLarge {
                size,
                limit: self.payload_limit,
            });
        }

        match change.mode {
            ChangeMode::DeleteOne | ChangeMode::DeleteMany => {
                let deleted = remove_matching(state, &change.selector, change.mode == ChangeMode::DeleteMany)?;
                Ok(Applied {
                    deleted,
                    ..Applied::default()
                })
            }
            ChangeMode::UpsertOne | ChangeMode::UpdateOne | ChangeMode::UpdateMany => {
                let payload = change.payload.as_ref().ok_or_else(|| {
                    StoreError::InvalidUpdate("update change without a payload".into())
                })?;
                let many = change.mode == ChangeMode::UpdateMany;
                let upsert = change.mode != ChangeMode::UpdateOne;
                self.update_matching(collection, state, &change.selector, payload, many, upsert)
            }
        }
    }

    fn update_matching(
        &self,
        collection: &str,
        state: &mut CollectionState,
        selector: &Document,
        update: &Document,
        many: bool,
        upsert: bool,
    ) -> Result<Applied, StoreError> {
        let mut positions = Vec::new();
        for (position, doc) in state.documents.iter().enumerate() {
            if matches(doc, selector)? {
                positions.push(position);
                if !many {
                    break;
                }
            }
        }

        let mut applied = Applied::default();
        if positions.is_empty() {
            if upsert {
                let mut doc = upsert_seed(selector)?;
                apply_update(&mut doc, update, true)?;
                self.assign_id(&mut doc);
                check_unique(collection, state, &doc, None)?;
                state.documents.push(doc);
                applied.upserted = 1;
            }
            return Ok(applied);
        }

        for position in positions {
            let mut next = state.documents[position].clone();
            let modified = apply_update(&mut next, update, false)?;
            applied.matched += 1;
            if modified {
                check_unique(collection, state, &next, Some(position))?;
                state.documents[position] = next;
                applied.modified += 1;
            }
        }
        Ok(applied)
    }
}

fn remove_matching(state: &mut CollectionState, selector: &Document, many: bool) -> Result<u64, StoreError> {
    let mut kept = Vec::with_capacity(state.documents.len());
    let mut deleted = 0;
    let mut failure = None;
    for doc in state.documents.drain(..) {
        if failure.is_some() || (!many && deleted > 0) {
            kept.push(doc);
            continue;
        }
        match matches(&doc, selector) {
            Ok(true) => deleted += 1,
            Ok(false) => kept.push(doc),
            Err(err) => {
                failure = Some(err);
                kept.push(doc);
            }
        }
    }
    state.documents = kept;
    match failure {
        Some(err) => Err(err),
        None => Ok(deleted),
    }
}

fn index_key(doc: &Document, index: &IndexSpec) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|(field, _)| {
            lookup_path(doc, field)
                .into_iter()
                .next()
                .cloned()
                .unwrap_or(Value::Null)
        })
        .collect()
}

/// Reject `doc` when a unique index already holds its key. `skip` is the
/// position `doc` replaces, if any.
fn check_unique(
    collection: &str,
    state: &CollectionState,
    doc: &Document,
    skip: Option<usize>,
) -> Result<(), StoreError> {
    for index in state.indexes.iter().filter(|index| index.unique) {
        let key = index_key(doc, index);
        let taken = state
            .documents
            .iter()
            .enumerate()
            .filter(|(position, _)| Some(*position) != skip)
            .any(|(_, other)| {
                index_key(other, index)
                    .iter()
                    .zip(&key)
                    .all(|(a, b)| values_equal(a, b))
            });
        if taken {
            return Err(StoreError::DuplicateKey {
                collection: collection.to_string(),
                index: index.resolved_name(),
            });
        }
    }
    Ok(())
}

impl DocumentStore for MemoryStore {
    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        if let Some(error) = self.faults.lock().listing.get(database) {
            return Err(error.clone());
        }
        let mut names: Vec<String> = self
            .databases
            .read()
            .get(database)
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    fn create_collection(&self, database: &str, collection: &str) -> Result<(), StoreError> {
        self.check_fault(database, collection)?;
        let mut databases = self.databases.write();
        let collections = databases.entry(database.to_string()).or_default();
        if collections.contains_key(collection) {
            return Err(StoreError::CollectionExists(collection.to_string()));
        }
        collections.insert(collection.to_string(), CollectionState::default());
        Ok(())
    }

    fn create_indexes(
        &self,
        database: &str,
        collection: &str,
        indexes: &[IndexSpec],
    ) -> Result<Vec<String>, StoreError> {
        self.check_fault(database, collection)?;
        let mut databases = self.databases.write();
        let state = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let mut names = Vec::with_capacity(indexes.len());
        for index in indexes {
            if index.keys.is_empty() {
                return Err(StoreError::Backend("index needs at least one key".into()));
            }
            let name = index.resolved_name();
            state.indexes.retain(|existing| existing.resolved_name() != name);
            state.indexes.push(index.clone());
            if index.unique {
                let keys: Vec<Vec<Value>> = state.documents.iter().map(|doc| index_key(doc, index)).collect();
                let duplicated = keys.iter().enumerate().any(|(i, key)| {
                    keys[..i]
                        .iter()
                        .any(|other| other.iter().zip(key).all(|(a, b)| values_equal(a, b)))
                });
                if duplicated {
                    state.indexes.pop();
                    return Err(StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        index: name,
                    });
                }
            }
            names.push(name);
        }
        Ok(names)
    }

    fn bulk_write(
        &self,
        database: &str,
        collection: &str,
        changes: &[Change],
        options: BulkWriteOptions,
    ) -> Result<BulkWriteResult, StoreError> {
        self.bulk_log.lock().push(BulkCall {
            database: database.to_string(),
            collection: collection.to_string(),
            operations: changes.len(),
            ordered: options.ordered,
        });
        self.check_fault(database, collection)?;
        if changes.is_empty() {
            return Err(StoreError::Backend("bulk write needs at least one operation".into()));
        }

        let mut databases = self.databases.write();
        let state = databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();

        let mut result = BulkWriteResult::default();
        for (index, change) in changes.iter().enumerate() {
            match self.apply_change(collection, state, change) {
                Ok(applied) => {
                    result.matched += applied.matched;
                    result.modified += applied.modified;
                    result.upserted += applied.upserted;
                    result.deleted += applied.deleted;
                }
                Err(error) => {
                    result.failures.push(BulkWriteFailure { index, error });
                    if options.ordered {
                        result.skipped = changes.len() - index - 1;
                        break;
                    }
                }
            }
        }
        trace!(database, collection, %result, "bulk write applied");
        Ok(result)
    }

    fn update_many(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError> {
        self.check_fault(database, collection)?;
        let mut databases = self.databases.write();
        let Some(state) = databases
            .get_mut(database)
            .and_then(|collections| collections.get_mut(collection))
        else {
            return Ok(UpdateResult::default());
        };
        let applied = self.update_matching(collection, state, selector, update, true, false)?;
        Ok(UpdateResult {
            matched: applied.matched,
            modified: applied.modified,
            upserted: applied.upserted,
        })
    }

    fn delete_many(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
    ) -> Result<DeleteResult, StoreError> {
        self.check_fault(database, collection)?;
        let mut databases = self.databases.write();
        let Some(state) = databases
            .get_mut(database)
            .and_then(|collections| collections.get_mut(collection))
        else {
            return Ok(DeleteResult::default());
        };
        let deleted = remove_matching(state, selector, true)?;
        Ok(DeleteResult { deleted })
    }

    fn count_documents(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
    ) -> Result<u64, StoreError> {
        self.check_fault(database, collection)?;
        let databases = self.databases.read();
        let Some(state) = databases
            .get(database)
            .and_then(|collections| collections.get(collection))
        else {
            return Ok(0);
        };
        let mut count = 0;
        for doc in &state.documents {
            if matches(doc, selector)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        stages: &[Document],
        _options: AggregateOptions,
    ) -> Result<Cursor, StoreError> {
        self.check_fault(database, collection)?;
        let documents = self.documents(database, collection);
        let results = run_pipeline(documents, stages)?;

        let key = (database.to_string(), collection.to_string());
        if let Some(error) = self.faults.lock().cursors.get(&key) {
            let partial: Vec<Document> = results.into_iter().take(1).collect();
            return Ok(Cursor::failed(partial, error.clone()));
        }
        Ok(Cursor::new(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use serde_json::json;

    const DB: &str = "rita";

    #[test]
    fn test_upsert_seeds_from_selector_and_assigns_id() {
        let store = MemoryStore::new();
        let change = Change::upsert(
            document! { "ip": "10.0.0.1" },
            document! { "$set": { "cid": 3 }, "$push": { "dat": { "ip": "10.0.0.1", "cid": 3 } } },
        );
        let result = store
            .bulk_write(DB, "hosts", &[change.clone(), change], BulkWriteOptions::default())
            .unwrap();
        assert_eq!(result.upserted, 1);
        assert_eq!(result.matched, 1);
        assert_eq!(result.modified, 1);

        let docs = store.documents(DB, "hosts");
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains_key("_id"));
        assert_eq!(docs[0]["ip"], json!("10.0.0.1"));
        assert_eq!(docs[0]["dat"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_update_one_does_not_insert() {
        let store = MemoryStore::new();
        let change = Change::update(document! { "ip": "x" }, document! { "$set": { "seen": true } });
        let result = store
            .bulk_write(DB, "hosts", &[change], BulkWriteOptions::default())
            .unwrap();
        assert_eq!(result, BulkWriteResult::default());
        assert!(store.documents(DB, "hosts").is_empty());
    }

    #[test]
    fn test_update_many_upserts_when_nothing_matches() {
        let store = MemoryStore::new();
        store
            .insert_many(DB, "uconn", [document! { "src": "a", "n": 1 }, document! { "src": "a", "n": 2 }])
            .unwrap();
        let touch = Change::update_many(document! { "src": "a" }, document! { "$inc": { "n": 10 } });
        let fresh = Change::update_many(document! { "src": "b" }, document! { "$inc": { "n": 1 } });
        let result = store
            .bulk_write(DB, "uconn", &[touch, fresh], BulkWriteOptions::default())
            .unwrap();
        assert_eq!((result.matched, result.modified, result.upserted), (2, 2, 1));
        assert_eq!(store.find(DB, "uconn", &document! { "n": { "$gt": 10 } }).unwrap().len(), 2);
        assert_eq!(store.find(DB, "uconn", &document! { "src": "b", "n": 1 }).unwrap().len(), 1);
    }

    #[test]
    fn test_unique_index_violation_is_a_per_item_failure() {
        let store = MemoryStore::new();
        store.create_collection(DB, "hostnames").unwrap();
        store
            .create_indexes(DB, "hostnames", &[IndexSpec::ascending("host").unique()])
            .unwrap();
        store.insert_many(DB, "hostnames", [document! { "host": "a.com" }]).unwrap();

        let rename = Change::update(document! { "host": "b.com" }, document! { "$set": { "host": "a.com" } });
        let changes = vec![
            Change::upsert(document! { "host": "b.com" }, document! { "$set": { "n": 1 } }),
            rename,
            Change::upsert(document! { "host": "c.com" }, document! { "$set": { "n": 1 } }),
        ];

        let unordered = store
            .bulk_write(DB, "hostnames", &changes, BulkWriteOptions { ordered: false })
            .unwrap();
        assert_eq!(unordered.upserted, 2);
        assert_eq!(unordered.failures.len(), 1);
        assert_eq!(unordered.failures[0].index, 1);
        assert!(matches!(unordered.failures[0].error, StoreError::DuplicateKey { .. }));
        assert_eq!(store.documents(DB, "hostnames").len(), 3);
    }

    #[test]
    fn test_ordered_bulk_stops_at_first_failure() {
        let store = MemoryStore::new();
        let changes = vec![
            Change::upsert(document! { "ip": "a" }, document! { "$set": { "n": 1 } }),
            Change::upsert(document! { "ip": "b" }, document! { "$bogus": { "n": 1 } }),
            Change::upsert(document! { "ip": "c" }, document! { "$set": { "n": 1 } }),
        ];
        let result = store
            .bulk_write(DB, "hosts", &changes, BulkWriteOptions { ordered: true })
            .unwrap();
        assert_eq!(result.upserted, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.skipped, 1);
        assert!(!result.is_complete());
    }

    #[test]
    fn test_payload_ceiling_counts_operation_envelope() {
        let change = Change::upsert(document! { "ip": "a" }, document! { "$set": { "n": 1 } });
        let exact = change.encoded_len() + OPERATION_ENVELOPE;

        let roomy = MemoryStore::with_payload_limit(exact);
        let result = roomy
            .bulk_write(DB, "hosts", &[change.clone()], BulkWriteOptions::default())
            .unwrap();
        assert!(result.is_complete());

        let tight = MemoryStore::with_payload_limit(exact - 1);
        let result = tight
            .bulk_write(DB, "hosts", &[change], BulkWriteOptions::default())
            .unwrap();
        assert!(matches!(
            result.failures[0].error,
            StoreError::PayloadTooLarge { .. }
        ));
    }

    #[test]
    fn test_delete_and_pull_by_chunk() {
        let store = MemoryStore::new();
        store
            .insert_many(
                DB,
                "hosts",
                [
                    document! { "ip": "a", "cid": 1, "dat": [{ "cid": 1 }] },
                    document! { "ip": "b", "cid": 2, "dat": [{ "cid": 1 }, { "cid": 2 }] },
                ],
            )
            .unwrap();
        let deleted = store.delete_many(DB, "hosts", &document! { "cid": 1 }).unwrap();
        assert_eq!(deleted.deleted, 1);
        let trimmed = store
            .update_many(
                DB,
                "hosts",
                &document! { "dat.cid": 1 },
                &document! { "$pull": { "dat": { "cid": 1 } } },
            )
            .unwrap();
        assert_eq!((trimmed.matched, trimmed.modified), (1, 1));
        assert_eq!(store.documents(DB, "hosts")[0]["dat"], json!([{ "cid": 2 }]));
        assert_eq!(store.delete_many(DB, "missing", &document! { "cid": 1 }).unwrap().deleted, 0);
    }

    #[test]
    fn test_faults_and_bulk_log() {
        let store = MemoryStore::new();
        store.inject_fault(DB, "hosts", StoreError::Backend("socket reset".into()));
        let change = Change::delete_one(document! { "ip": "a" });
        let err = store
            .bulk_write(DB, "hosts", &[change.clone()], BulkWriteOptions::default())
            .unwrap_err();
        assert_eq!(err, StoreError::Backend("socket reset".into()));
        assert_eq!(store.count_documents(DB, "hosts", &Document::new()).unwrap_err(), err);

        store.clear_faults();
        store
            .bulk_write(DB, "hosts", &[change], BulkWriteOptions { ordered: true })
            .unwrap();
        let calls = store.bulk_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].operations, 1);
        assert!(calls[1].ordered);
    }

    #[test]
    fn test_create_collection_and_index_names() {
        let store = MemoryStore::new();
        store.create_collection(DB, "uconn").unwrap();
        assert_eq!(
            store.create_collection(DB, "uconn").unwrap_err(),
            StoreError::CollectionExists("uconn".into())
        );
        let names = store
            .create_indexes(
                DB,
                "uconn",
                &[IndexSpec::new([("src", 1), ("dst", 1)]).unique(), IndexSpec::ascending("dat.cid")],
            )
            .unwrap();
        assert_eq!(names, vec!["src_1_dst_1", "dat.cid_1"]);
        assert_eq!(store.list_collections(DB).unwrap(), vec!["uconn"]);
        assert!(store.list_collections("other").unwrap().is_empty());
    }
}
