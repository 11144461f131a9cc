//! Default constants for flowsink configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Store Defaults
// =============================================================================

/// Default working database
pub const DEFAULT_DATABASE: &str = "flowsink";

/// Hard per-operation payload ceiling of the document store (16 MiB)
pub const STORE_PAYLOAD_LIMIT: usize = 16 * 1024 * 1024;

// =============================================================================
// Bulk Writer Defaults
// =============================================================================

/// Maximum changes per bulk call for one destination.
/// 1000 is accepted by the store but has misbehaved under load, so half of it.
pub const DEFAULT_BULK_MAX_COUNT: usize = 500;

/// Maximum estimated bytes per bulk call for one destination.
/// Kept well under [`STORE_PAYLOAD_LIMIT`] since the estimate leaves out
/// per-operation overhead.
pub const DEFAULT_BULK_MAX_SIZE: usize = 15 * 1000 * 1000;

/// Writer input channel capacity (0 = rendezvous, full back-pressure)
pub const DEFAULT_WRITER_CHANNEL_CAPACITY: usize = 0;

// =============================================================================
// Pipeline Defaults
// =============================================================================

/// Stage input channel capacity (0 = rendezvous, full back-pressure)
pub const DEFAULT_STAGE_CHANNEL_CAPACITY: usize = 0;

/// Worker threads for a pipeline stage when configured as 0 (auto).
/// Half the available cores, leaving room for writers and the producer.
pub fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}

// =============================================================================
// Retraction Defaults
// =============================================================================

/// Field holding the chunk a whole document belongs to
pub const DEFAULT_TAG_FIELD: &str = "cid";

/// Array field holding per-chunk history entries
pub const DEFAULT_HISTORY_FIELD: &str = "dat";

/// Retraction runs one worker so deletes and trims don't contend
pub const DEFAULT_RETRACTION_WORKERS: usize = 1;

// =============================================================================
// Logging Defaults
// =============================================================================

/// Default `tracing` filter directive
pub const DEFAULT_LOG_FILTER: &str = "info";
