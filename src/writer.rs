//! # Bulk Writer
//!
//! Batches changes per destination collection and applies them with bulk
//! writes from one background thread.
//!
//! A destination is flushed when it reaches `max_count` changes or when its
//! estimated size reaches `max_size`, and every buffer is flushed once more
//! when the writer closes. Producers only enqueue; with the default channel
//! capacity of 0 a producer blocks until the writer thread takes its set,
//! which pushes back on upstream workers while a flush is in flight.

use crate::change::{Change, ChangeSet};
use crate::config::defaults::{DEFAULT_BULK_MAX_COUNT, DEFAULT_BULK_MAX_SIZE, DEFAULT_WRITER_CHANNEL_CAPACITY};
use crate::document::Document;
use crate::error::Closed;
use crate::gateway::{BulkWriteOptions, Collection, Database};
use crate::pipeline::ChangeSink;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Configuration for a bulk writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkWriterConfig {
    /// Maximum changes buffered per destination before a flush
    pub max_count: usize,
    /// Maximum estimated bytes buffered per destination before a flush
    pub max_size: usize,
    /// Input channel capacity (0 = rendezvous)
    pub channel_capacity: usize,
    /// Stop each bulk write at its first failing change
    pub ordered: bool,
}

impl Default for BulkWriterConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_BULK_MAX_COUNT,
            max_size: DEFAULT_BULK_MAX_SIZE,
            channel_capacity: DEFAULT_WRITER_CHANNEL_CAPACITY,
            ordered: false,
        }
    }
}

impl BulkWriterConfig {
    /// Default thresholds with a custom count limit
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            ..Default::default()
        }
    }
}

/// Totals of one writer session.
///
/// After close, `changes == applied + failed + dropped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub change_sets: u64,
    pub changes: u64,
    pub applied: u64,
    pub failed: u64,
    /// Inert changes discarded without being sent
    pub dropped: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

#[derive(Debug, Default)]
struct WriterCounters {
    change_sets: AtomicU64,
    changes: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

impl WriterCounters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WriterReport {
        WriterReport {
            change_sets: self.change_sets.load(Ordering::Relaxed),
            changes: self.changes.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Background bulk writer for one working database.
pub struct BulkWriter {
    name: Arc<str>,
    /// Dropped on close, which ends the writer loop once in-flight submits land
    tx: RwLock<Option<Sender<ChangeSet>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<WriterCounters>,
}

impl BulkWriter {
    /// Start the writer thread.
    pub fn start(database: &Database, name: impl Into<String>, config: BulkWriterConfig) -> std::io::Result<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = crossbeam_channel::bounded(config.channel_capacity);
        let counters = Arc::new(WriterCounters::default());

        let writer_name = Arc::clone(&name);
        let writer_database = database.clone();
        let writer_counters = Arc::clone(&counters);
        let handle = thread::Builder::new()
            .name(format!("writer-{name}"))
            .spawn(move || {
                writer_loop(rx, writer_database, config, writer_name, writer_counters);
            })?;

        debug!(writer = %name, database = database.name(), "Started bulk writer");
        Ok(Self {
            name,
            tx: RwLock::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a change set for writing.
    ///
    /// Blocks while the writer is busy when the channel is a rendezvous
    /// channel. Fails once the writer has been closed.
    pub fn submit(&self, changes: ChangeSet) -> Result<(), Closed> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or_else(|| Closed(self.name.to_string()))?;
        tx.send(changes).map_err(|_| Closed(self.name.to_string()))
    }

    /// Totals so far.
    pub fn report(&self) -> WriterReport {
        self.counters.snapshot()
    }

    /// Stop accepting input, write everything still buffered and wait for
    /// the writer thread. Later calls return the same report.
    pub fn close(&self) -> WriterReport {
        drop(self.tx.write().take());

        let mut handle = self.handle.lock();
        if let Some(handle) = handle.take() {
            if handle.join().is_err() {
                error!(writer = %self.name, "Bulk writer thread panicked");
            }
            let report = self.counters.snapshot();
            info!(
                writer = %self.name,
                changes = report.changes,
                applied = report.applied,
                failed = report.failed,
                dropped = report.dropped,
                flushes = report.flushes,
                "Closed bulk writer"
            );
        }
        self.counters.snapshot()
    }
}

impl ChangeSink for BulkWriter {
    fn submit(&self, changes: ChangeSet) -> Result<(), Closed> {
        BulkWriter::submit(self, changes)
    }

    fn close(&self) {
        BulkWriter::close(self);
    }
}

impl Drop for BulkWriter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pending changes for one destination collection.
struct BufferedDestination {
    collection: Collection,
    pending: Vec<Change>,
    size: usize,
}

impl BufferedDestination {
    fn new(collection: Collection) -> Self {
        Self {
            collection,
            pending: Vec::new(),
            size: 0,
        }
    }

    fn count(&self) -> usize {
        self.pending.len()
    }
}

struct WriterState {
    name: Arc<str>,
    database: Database,
    config: BulkWriterConfig,
    counters: Arc<WriterCounters>,
    buffers: Vec<BufferedDestination>,
}

impl WriterState {
    fn buffer_index(&mut self, destination: &str) -> usize {
        match self
            .buffers
            .iter()
            .position(|buffer| buffer.collection.name() == destination)
        {
            Some(index) => index,
            None => {
                self.buffers
                    .push(BufferedDestination::new(self.database.collection(destination)));
                self.buffers.len() - 1
            }
        }
    }

    fn accept(&mut self, destination: &str, change: Change) {
        WriterCounters::add(&self.counters.changes, 1);
        if change.is_inert() {
            WriterCounters::add(&self.counters.dropped, 1);
            debug!(writer = %self.name, collection = destination, mode = ?change.mode, "Dropped change without selector or payload");
            return;
        }

        let index = self.buffer_index(destination);
        let change_size = change.encoded_len();
        let (max_count, max_size) = (self.config.max_count, self.config.max_size);

        let buffer = &self.buffers[index];
        if buffer.count() >= max_count || buffer.size + change_size >= max_size {
            self.flush(index);
        }

        let buffer = &mut self.buffers[index];
        buffer.pending.push(change);
        buffer.size += change_size;

        if buffer.count() >= max_count || buffer.size >= max_size {
            self.flush(index);
        }
    }

    fn flush_all(&mut self) {
        for index in 0..self.buffers.len() {
            self.flush(index);
        }
    }

    fn flush(&mut self, index: usize) {
        let options = BulkWriteOptions {
            ordered: self.config.ordered,
        };
        let buffer = &mut self.buffers[index];
        if buffer.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut buffer.pending);
        let size = std::mem::replace(&mut buffer.size, 0);
        let count = batch.len() as u64;
        let collection = buffer.collection.name();
        WriterCounters::add(&self.counters.flushes, 1);

        match buffer.collection.bulk_write(&batch, options) {
            Ok(result) => {
                for failure in &result.failures {
                    let selector = batch
                        .get(failure.index)
                        .map(|change| render(&change.selector))
                        .unwrap_or_default();
                    error!(
                        writer = %self.name,
                        collection,
                        index = failure.index,
                        selector = %selector,
                        error = %failure.error,
                        "Failed bulk write item"
                    );
                }
                if result.skipped > 0 {
                    warn!(writer = %self.name, collection, skipped = result.skipped, "Ordered bulk write stopped early");
                }
                let failed = (result.failures.len() + result.skipped) as u64;
                WriterCounters::add(&self.counters.applied, count.saturating_sub(failed));
                WriterCounters::add(&self.counters.failed, failed);
                if !result.is_complete() {
                    WriterCounters::add(&self.counters.failed_flushes, 1);
                }
                debug!(writer = %self.name, collection, count, size, %result, "Flushed bulk buffer");
            }
            Err(err) => {
                WriterCounters::add(&self.counters.failed, count);
                WriterCounters::add(&self.counters.failed_flushes, 1);
                let selector = batch
                    .first()
                    .map(|change| render(&change.selector))
                    .unwrap_or_default();
                error!(
                    writer = %self.name,
                    collection,
                    count,
                    size,
                    first_selector = %selector,
                    error = %err,
                    "Failed bulk write"
                );
            }
        }
    }
}

fn render(doc: &Document) -> String {
    serde_json::to_string(doc).unwrap_or_default()
}

fn writer_loop(
    rx: Receiver<ChangeSet>,
    database: Database,
    config: BulkWriterConfig,
    name: Arc<str>,
    counters: Arc<WriterCounters>,
) {
    let mut state = WriterState {
        name,
        database,
        config,
        counters,
        buffers: Vec::new(),
    };

    // ends once every sender is gone
    for changes in rx.iter() {
        WriterCounters::add(&state.counters.change_sets, 1);
        for (destination, batch) in changes {
            for change in batch {
                state.accept(&destination, change);
            }
        }
    }

    state.flush_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use crate::error::StoreError;
    use crate::gateway::StoreGateway;
    use crate::memory::MemoryStore;
    use std::time::{Duration, Instant};

    const DB: &str = "writer-test";

    fn setup() -> (Arc<MemoryStore>, Database) {
        let store = Arc::new(MemoryStore::new());
        let gateway = StoreGateway::from_shared(store.clone());
        (store, gateway.select_database(DB))
    }

    fn host_change(i: usize) -> Change {
        Change::upsert(
            document! { "ip": format!("10.0.0.{i}") },
            document! { "$set": { "cid": 1 } },
        )
    }

    #[test]
    fn test_buffers_until_close() {
        let (store, db) = setup();
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::default()).unwrap();
        for i in 0..10 {
            writer.submit(ChangeSet::single("hosts", host_change(i))).unwrap();
        }
        let report = writer.close();

        assert_eq!(store.documents(DB, "hosts").len(), 10);
        assert_eq!(store.bulk_calls().len(), 1);
        assert_eq!(report.change_sets, 10);
        assert_eq!(report.applied, 10);
        assert_eq!(report.flushes, 1);
    }

    #[test]
    fn test_count_threshold_bounds_every_bulk_call() {
        let (store, db) = setup();
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::with_max_count(3)).unwrap();
        let set: ChangeSet = (0..10)
            .map(|i| ("hosts".to_string(), host_change(i)))
            .collect();
        writer.submit(set).unwrap();
        writer.close();

        let calls: Vec<usize> = store.bulk_calls().iter().map(|call| call.operations).collect();
        assert_eq!(calls, vec![3, 3, 3, 1]);
        assert_eq!(store.documents(DB, "hosts").len(), 10);
    }

    #[test]
    fn test_size_threshold_flushes_before_overflow() {
        let (store, db) = setup();
        let size = host_change(1).encoded_len();
        let config = BulkWriterConfig {
            max_size: size * 2 + 1,
            ..Default::default()
        };
        let writer = BulkWriter::start(&db, "host", config).unwrap();
        for i in 1..=5 {
            writer.submit(ChangeSet::single("hosts", host_change(i))).unwrap();
        }
        writer.close();
        let calls: Vec<usize> = store.bulk_calls().iter().map(|call| call.operations).collect();
        assert_eq!(calls, vec![2, 2, 1]);
    }

    #[test]
    fn test_single_change_flushes_without_close_when_max_count_is_one() {
        let (store, db) = setup();
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::with_max_count(1)).unwrap();
        let change = Change::upsert(
            document! { "ip": "10.0.0.1" },
            document! { "$push": { "dat": { "ip": "10.0.0.1", "cid": 3 } } },
        );
        writer.submit(ChangeSet::single("hosts", change)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while store.documents(DB, "hosts").is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.documents(DB, "hosts").len(), 1);
        writer.close();
        assert_eq!(store.bulk_calls().len(), 1);
    }

    #[test]
    fn test_inert_changes_are_dropped() {
        let (store, db) = setup();
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::default()).unwrap();
        let mut set = ChangeSet::new();
        set.push("hosts", Change::delete_many(Document::new()));
        set.push("hosts", host_change(1));
        writer.submit(set).unwrap();
        let report = writer.close();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(store.bulk_calls()[0].operations, 1);
    }

    #[test]
    fn test_failed_flush_is_counted_and_writer_keeps_going() {
        let (store, db) = setup();
        store.inject_fault(DB, "broken", StoreError::Backend("socket reset".into()));
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::default()).unwrap();
        let mut set = ChangeSet::new();
        set.push("broken", host_change(1));
        set.push("hosts", host_change(2));
        writer.submit(set).unwrap();
        let report = writer.close();

        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed_flushes, 1);
        assert_eq!(report.changes, report.applied + report.failed + report.dropped);
        assert_eq!(store.documents(DB, "hosts").len(), 1);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_late_submits() {
        let (_store, db) = setup();
        let writer = BulkWriter::start(&db, "host", BulkWriterConfig::default()).unwrap();
        writer.submit(ChangeSet::single("hosts", host_change(1))).unwrap();
        let first = writer.close();
        let second = writer.close();
        assert_eq!(first, second);
        assert_eq!(
            writer.submit(ChangeSet::single("hosts", host_change(2))),
            Err(Closed("host".into()))
        );
    }
}
