//! # Flowsink
//!
//! The write path of a network traffic analytics pipeline: parsed records go
//! through worker-pool stages that compute partial documents, which are
//! merged per entity, batched per collection and bulk-written into a
//! document store under a rolling, chunk-tagged retention scheme.

pub mod analysis;
pub mod change;
pub mod config;
pub mod document;
pub mod error;
pub mod gateway;
pub mod logging;
/// Test and embedding backend; the write path only depends on [`DocumentStore`].
pub mod memory;
pub mod merge;
pub mod pipeline;
pub mod retraction;
pub mod writer;

// Re-export main types for convenience
pub use change::{Change, ChangeMode, ChangeSet};
pub use config::{ConfigError, FlowsinkConfig};
pub use document::{ChunkId, Document};
pub use error::{Closed, StoreError};
pub use gateway::{Collection, Database, DocumentStore, IndexSpec, StoreGateway};
pub use memory::MemoryStore;
pub use merge::{merge_documents, MergeConflict};
pub use pipeline::{ChangeSink, PipelineConfig, PipelineStage, StageReport, WorkerPool};
pub use retraction::{ChunkRemover, ChunkUpdater, HistoryUpdate, RetractionConfig, RetractionReport};
pub use writer::{BulkWriter, BulkWriterConfig, WriterReport};

use std::sync::Arc;

/// Main entry point: a store gateway bound to a validated configuration.
#[derive(Clone)]
pub struct Flowsink {
    gateway: StoreGateway,
    config: Arc<FlowsinkConfig>,
}

impl Flowsink {
    /// Create an instance over `gateway`, rejecting invalid configuration.
    pub fn new(gateway: StoreGateway, config: FlowsinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            gateway,
            config: Arc::new(config),
        })
    }

    /// Create an instance over a fresh [`MemoryStore`] sized by the
    /// configured payload limit. The store is returned for inspection.
    pub fn in_memory(config: FlowsinkConfig) -> Result<(Self, Arc<MemoryStore>), ConfigError> {
        let store = Arc::new(MemoryStore::with_payload_limit(config.store.payload_limit));
        let flowsink = Self::new(StoreGateway::from_shared(store.clone()), config)?;
        Ok((flowsink, store))
    }

    pub fn config(&self) -> &FlowsinkConfig {
        &self.config
    }

    pub fn gateway(&self) -> &StoreGateway {
        &self.gateway
    }

    /// The configured working database.
    pub fn database(&self) -> Database {
        self.gateway.select_database(self.config.store.database.as_str())
    }

    /// Chunk this run stamps its writes with.
    pub fn current_chunk(&self) -> ChunkId {
        self.config.rolling.current_chunk
    }

    /// Start a bulk writer on the working database.
    pub fn bulk_writer(&self, name: impl Into<String>) -> std::io::Result<BulkWriter> {
        BulkWriter::start(&self.database(), name, self.config.writer.clone())
    }

    /// Start removing `chunk` from the working database.
    pub fn chunk_remover(&self, chunk: ChunkId) -> std::io::Result<ChunkRemover> {
        ChunkRemover::start(&self.database(), chunk, &self.config.retraction)
    }

    pub fn chunk_updater(&self) -> std::io::Result<ChunkUpdater> {
        ChunkUpdater::start(&self.database(), &self.config.retraction)
    }
}
