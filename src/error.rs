//! # Errors
//!
//! Error kinds surfaced by the store gateway and the write-path workers.

use thiserror::Error;

/// Failures reported by a [`DocumentStore`](crate::gateway::DocumentStore) backend
/// or by the gateway on top of it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// The named collection does not exist. Expected during rolling analysis
    /// (a domain may not have produced data yet), so callers usually skip
    /// rather than alarm.
    #[error("collection `{0}` does not exist")]
    NotFound(String),
    #[error("collection `{0}` already exists")]
    CollectionExists(String),
    #[error("duplicate key for unique index `{index}` in `{collection}`")]
    DuplicateKey { collection: String, index: String },
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("invalid aggregation stage: {0}")]
    InvalidPipeline(String),
    /// A single store operation exceeded the backend's payload ceiling.
    #[error("operation payload of {size} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { size: usize, limit: usize },
    /// Connectivity or server-side failure.
    #[error("store backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Returned when input is offered to a worker that has already been closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("`{0}` is closed and no longer accepts input")]
pub struct Closed(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinguishable() {
        assert!(StoreError::NotFound("conn".into()).is_not_found());
        assert!(!StoreError::Backend("socket reset".into()).is_not_found());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = StoreError::PayloadTooLarge {
            size: 17_000_000,
            limit: 16_777_216,
        };
        assert_eq!(
            err.to_string(),
            "operation payload of 17000000 bytes exceeds the 16777216 byte ceiling"
        );
        assert_eq!(
            Closed("host".into()).to_string(),
            "`host` is closed and no longer accepts input"
        );
    }
}
