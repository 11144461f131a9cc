//! # Store Gateway
//!
//! The write path talks to the document store through the [`DocumentStore`]
//! contract. [`StoreGateway`] owns the shared backend and hands out explicit
//! [`Database`] and [`Collection`] handles; there is no process-wide
//! "selected database", so one gateway can serve any number of concurrent
//! pipeline stages.

use crate::change::Change;
use crate::document::Document;
use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed fields in order, with direction (`1` ascending, `-1` descending).
    pub keys: Vec<(String, i32)>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl IndexSpec {
    pub fn new<K, I>(keys: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, i32)>,
    {
        Self {
            keys: keys.into_iter().map(|(field, dir)| (field.into(), dir)).collect(),
            unique: false,
            name: None,
        }
    }

    /// Single ascending field.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new([(field.into(), 1)])
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit name, or `field_dir` pairs joined with `_` (e.g. `ip_1_network_uuid_1`).
    pub fn resolved_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.keys
            .iter()
            .map(|(field, dir)| format!("{field}_{dir}"))
            .collect::<Vec<_>>()
            .join("_")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkWriteOptions {
    /// Stop at the first failing operation instead of applying the rest.
    pub ordered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateOptions {
    /// Let the store spill large intermediate results to disk.
    pub allow_disk_use: bool,
}

/// One operation of a bulk write that the store rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteFailure {
    /// Position of the failed change within the submitted batch.
    pub index: usize,
    pub error: StoreError,
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkWriteResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
    pub deleted: u64,
    /// Operations the store did not apply; empty when the batch fully succeeded.
    pub failures: Vec<BulkWriteFailure>,
    /// Operations never attempted because an ordered batch stopped early.
    pub skipped: usize,
}

impl BulkWriteResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

impl fmt::Display for BulkWriteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matched={} modified={} upserted={} deleted={} failed={} skipped={}",
            self.matched,
            self.modified,
            self.upserted,
            self.deleted,
            self.failures.len(),
            self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteResult {
    pub deleted: u64,
}

/// Result stream of an aggregation.
///
/// A backend may fail part-way through producing results; that failure is
/// carried by the cursor and checked by the gateway before the cursor is
/// handed out.
#[derive(Debug, Default)]
pub struct Cursor {
    documents: VecDeque<Document>,
    error: Option<StoreError>,
}

impl Cursor {
    pub fn new(documents: impl IntoIterator<Item = Document>) -> Self {
        Self {
            documents: documents.into_iter().collect(),
            error: None,
        }
    }

    /// A cursor that produced `documents` before failing with `error`.
    pub fn failed(documents: impl IntoIterator<Item = Document>, error: StoreError) -> Self {
        Self {
            documents: documents.into_iter().collect(),
            error: Some(error),
        }
    }

    pub fn error(&self) -> Option<&StoreError> {
        self.error.as_ref()
    }

    pub fn remaining(&self) -> usize {
        self.documents.len()
    }

    /// Decode every remaining document into `T`.
    pub fn deserialize<T: DeserializeOwned>(self) -> Result<Vec<T>, serde_json::Error> {
        self.documents
            .into_iter()
            .map(|doc| serde_json::from_value(serde_json::Value::Object(doc)))
            .collect()
    }
}

impl Iterator for Cursor {
    type Item = Document;

    fn next(&mut self) -> Option<Document> {
        self.documents.pop_front()
    }
}

/// Wire contract of the document store the pipeline persists into.
///
/// Implementations must provide per-document atomicity for each operation;
/// nothing above this trait relies on cross-document transactions.
pub trait DocumentStore: Send + Sync {
    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;

    fn create_collection(&self, database: &str, collection: &str) -> Result<(), StoreError>;

    /// Create secondary indexes, returning their names.
    fn create_indexes(
        &self,
        database: &str,
        collection: &str,
        indexes: &[IndexSpec],
    ) -> Result<Vec<String>, StoreError>;

    fn bulk_write(
        &self,
        database: &str,
        collection: &str,
        changes: &[Change],
        options: BulkWriteOptions,
    ) -> Result<BulkWriteResult, StoreError>;

    fn update_many(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError>;

    fn delete_many(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
    ) -> Result<DeleteResult, StoreError>;

    fn count_documents(
        &self,
        database: &str,
        collection: &str,
        selector: &Document,
    ) -> Result<u64, StoreError>;

    fn aggregate(
        &self,
        database: &str,
        collection: &str,
        stages: &[Document],
        options: AggregateOptions,
    ) -> Result<Cursor, StoreError>;
}

/// Shared entry point to the store.
#[derive(Clone)]
pub struct StoreGateway {
    backend: Arc<dyn DocumentStore>,
}

impl StoreGateway {
    pub fn new<S>(backend: S) -> Self
    where
        S: DocumentStore + 'static,
    {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<dyn DocumentStore>) -> Self {
        Self { backend }
    }

    /// Handle on the named working database. Performs no I/O.
    pub fn select_database(&self, name: impl Into<String>) -> Database {
        Database {
            backend: Arc::clone(&self.backend),
            name: Arc::from(name.into()),
        }
    }
}

/// Handle on one working database.
#[derive(Clone)]
pub struct Database {
    backend: Arc<dyn DocumentStore>,
    name: Arc<str>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            database: self.clone(),
            name: Arc::from(name.into()),
        }
    }

    /// Whether `name` exists. Lookup failures are logged and reported as absent.
    pub fn collection_exists(&self, name: &str) -> bool {
        match self.backend.list_collections(&self.name) {
            Ok(names) => names.iter().any(|existing| existing == name),
            Err(err) => {
                error!(database = %self.name, collection = name, error = %err, "Failed collection name lookup");
                false
            }
        }
    }

    /// Create `name` and then its secondary indexes.
    ///
    /// When index creation fails the collection is left in place; callers
    /// check [`collection_exists`](Self::collection_exists) first or use
    /// [`ensure_collection`](Self::ensure_collection).
    pub fn create_collection(&self, name: &str, indexes: &[IndexSpec]) -> Result<(), StoreError> {
        debug!(database = %self.name, collection = name, indexes = indexes.len(), "Building collection");
        self.backend.create_collection(&self.name, name)?;
        if !indexes.is_empty() {
            self.backend.create_indexes(&self.name, name, indexes)?;
        }
        Ok(())
    }

    /// Create `name` with its indexes unless it already exists. Returns
    /// whether the collection was created.
    pub fn ensure_collection(&self, name: &str, indexes: &[IndexSpec]) -> Result<bool, StoreError> {
        if self.collection_exists(name) {
            return Ok(false);
        }
        self.create_collection(name, indexes)?;
        Ok(true)
    }

    /// Run an aggregation pipeline against `source`, allowing the store to
    /// spill to disk.
    pub fn run_aggregation(&self, source: &str, stages: &[Document]) -> Result<Cursor, StoreError> {
        if !self.collection_exists(source) {
            warn!(database = %self.name, collection = source, "Failed aggregation: source collection doesn't exist");
            return Err(StoreError::NotFound(source.to_string()));
        }

        let options = AggregateOptions {
            allow_disk_use: true,
        };
        let cursor = self.backend.aggregate(&self.name, source, stages, options)?;
        if let Some(err) = cursor.error() {
            error!(database = %self.name, collection = source, error = %err, "Failed aggregate operation");
            return Err(err.clone());
        }
        Ok(cursor)
    }
}

/// Handle on one collection of a [`Database`].
#[derive(Clone, Debug)]
pub struct Collection {
    database: Database,
    name: Arc<str>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn bulk_write(&self, changes: &[Change], options: BulkWriteOptions) -> Result<BulkWriteResult, StoreError> {
        self.database
            .backend
            .bulk_write(&self.database.name, &self.name, changes, options)
    }

    pub fn update_many(&self, selector: &Document, update: &Document) -> Result<UpdateResult, StoreError> {
        self.database
            .backend
            .update_many(&self.database.name, &self.name, selector, update)
    }

    pub fn delete_many(&self, selector: &Document) -> Result<DeleteResult, StoreError> {
        self.database
            .backend
            .delete_many(&self.database.name, &self.name, selector)
    }

    pub fn count_documents(&self, selector: &Document) -> Result<u64, StoreError> {
        self.database
            .backend
            .count_documents(&self.database.name, &self.name, selector)
    }
}
