//! # Pipeline Stages
//!
//! Worker pools that turn parsed records into change sets and hand them to
//! a downstream sink (normally a [`BulkWriter`](crate::writer::BulkWriter)).
//!
//! Stages are closed front to back: closing a stage drains its input, joins
//! its workers and only then closes the next stage, so every record
//! collected before close has reached the store once the cascade returns.

use crate::change::ChangeSet;
use crate::config::defaults::{default_worker_count, DEFAULT_STAGE_CHANNEL_CAPACITY};
use crate::error::Closed;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Configuration for a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads (0 = half the available cores, at least 1)
    pub workers: usize,
    /// Input channel capacity (0 = rendezvous)
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            channel_capacity: DEFAULT_STAGE_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Resolved number of worker threads
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            default_worker_count()
        } else {
            self.workers
        }
    }
}

/// Downstream consumer of change sets.
pub trait ChangeSink: Send + Sync {
    fn submit(&self, changes: ChangeSet) -> Result<(), Closed>;

    /// Flush and stop. Must be idempotent.
    fn close(&self);
}

struct PoolState {
    handles: Vec<JoinHandle<()>>,
    closed: bool,
}

/// N named threads draining one bounded channel.
pub struct WorkerPool<T: Send + 'static> {
    name: Arc<str>,
    tx: RwLock<Option<Sender<T>>>,
    state: Mutex<PoolState>,
    workers: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads (at least one) running `work` on every item.
    pub fn spawn<F>(name: impl Into<String>, workers: usize, channel_capacity: usize, work: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let name: Arc<str> = Arc::from(name.into());
        let workers = workers.max(1);
        let (tx, rx) = crossbeam_channel::bounded(channel_capacity);
        let work = Arc::new(work);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let worker_rx: Receiver<T> = rx.clone();
            let worker_fn = Arc::clone(&work);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{id}"))
                .spawn(move || {
                    for item in worker_rx.iter() {
                        worker_fn(item);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // let the workers already running see a closed channel
                    drop(tx);
                    join_workers(&name, handles);
                    return Err(err);
                }
            }
        }

        debug!(pool = %name, workers, "Started worker pool");
        Ok(Self {
            name,
            tx: RwLock::new(Some(tx)),
            state: Mutex::new(PoolState {
                handles,
                closed: false,
            }),
            workers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Hand one item to the next free worker.
    pub fn send(&self, item: T) -> Result<(), Closed> {
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or_else(|| Closed(self.name.to_string()))?;
        tx.send(item).map_err(|_| Closed(self.name.to_string()))
    }

    /// Close the input and join every worker.
    ///
    /// Returns `true` for the call that performed the shutdown. Concurrent
    /// callers wait until the workers are joined.
    pub fn close(&self) -> bool {
        drop(self.tx.write().take());

        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        join_workers(&self.name, state.handles.drain(..));
        state.closed = true;
        true
    }
}

/// Join every handle, logging workers that panicked. Returns how many did.
fn join_workers(pool: &str, handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    let mut panicked = 0;
    for handle in handles {
        if handle.join().is_err() {
            panicked += 1;
            error!(pool, "Worker thread panicked");
        }
    }
    panicked
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Totals of one stage session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageReport {
    pub received: u64,
    /// Records whose change set went downstream
    pub forwarded: u64,
    /// Records that produced no changes
    pub skipped: u64,
    /// Records whose computation failed
    pub failed: u64,
}

#[derive(Debug, Default)]
struct StageCounters {
    received: AtomicU64,
    forwarded: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl StageCounters {
    fn snapshot(&self) -> StageReport {
        StageReport {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A worker-pool stage computing change sets from records of type `R`.
pub struct PipelineStage<R: Send + 'static> {
    pool: WorkerPool<R>,
    counters: Arc<StageCounters>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl<R: Send + 'static> PipelineStage<R> {
    /// Start a stage.
    ///
    /// `compute` runs on the workers; a non-empty result is passed to
    /// `sink`. A compute error skips that record only. `on_close` runs once,
    /// after every worker has finished.
    pub fn start<C, S, F>(
        name: impl Into<String>,
        config: &PipelineConfig,
        compute: C,
        sink: S,
        on_close: F,
    ) -> std::io::Result<Self>
    where
        C: Fn(R) -> anyhow::Result<Option<ChangeSet>> + Send + Sync + 'static,
        S: Fn(ChangeSet) + Send + Sync + 'static,
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let counters = Arc::new(StageCounters::default());
        let stage_counters = Arc::clone(&counters);
        let stage_name = name.clone();

        let pool = WorkerPool::spawn(
            name,
            config.worker_count(),
            config.channel_capacity,
            move |record: R| {
                stage_counters.received.fetch_add(1, Ordering::Relaxed);
                match compute(record) {
                    Ok(Some(changes)) if !changes.is_empty() => {
                        sink(changes);
                        stage_counters.forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {
                        stage_counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        stage_counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(stage = %stage_name, error = %format!("{err:#}"), "Failed to compute changes");
                    }
                }
            },
        )?;

        Ok(Self {
            pool,
            counters,
            on_close: Mutex::new(Some(Box::new(on_close))),
        })
    }

    /// Start a stage feeding `downstream`, which is closed when this stage closes.
    pub fn into_sink<C, K>(
        name: impl Into<String>,
        config: &PipelineConfig,
        compute: C,
        downstream: Arc<K>,
    ) -> std::io::Result<Self>
    where
        C: Fn(R) -> anyhow::Result<Option<ChangeSet>> + Send + Sync + 'static,
        K: ChangeSink + ?Sized + 'static,
    {
        let name = name.into();
        let sink_name = name.clone();
        let submit_to = Arc::clone(&downstream);
        Self::start(
            name,
            config,
            compute,
            move |changes| {
                if let Err(err) = submit_to.submit(changes) {
                    error!(stage = %sink_name, error = %err, "Dropped change set for closed sink");
                }
            },
            move || downstream.close(),
        )
    }

    pub fn name(&self) -> &str {
        self.pool.name()
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    /// Queue a record. Blocks while all workers are busy with a rendezvous
    /// channel; fails once the stage is closed.
    pub fn collect(&self, record: R) -> Result<(), Closed> {
        self.pool.send(record)
    }

    /// Totals so far.
    pub fn report(&self) -> StageReport {
        self.counters.snapshot()
    }

    /// Stop accepting records, wait for the workers, then run the close
    /// callback. Idempotent; concurrent callers return after the first
    /// finishes.
    pub fn close(&self) -> StageReport {
        let mut on_close = self.on_close.lock();
        if self.pool.close() {
            if let Some(callback) = on_close.take() {
                callback();
            }
            let report = self.counters.snapshot();
            info!(
                stage = self.pool.name(),
                received = report.received,
                forwarded = report.forwarded,
                skipped = report.skipped,
                failed = report.failed,
                "Closed pipeline stage"
            );
        }
        drop(on_close);
        self.counters.snapshot()
    }
}

impl<R: Send + 'static> Drop for PipelineStage<R> {
    fn drop(&mut self) {
        self.close();
    }
}
