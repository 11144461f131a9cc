//! # Analysis Domains
//!
//! Per-domain wiring on top of the write path. Each domain turns its parsed
//! input into one upsert per entity, stamped with the current chunk, and
//! persists it through a pipeline stage feeding a bulk writer.

pub mod hostname;

pub use hostname::{
    hostname_indexes, upsert_hostnames, HostnameAnalyzer, HostnameInput, UpsertSummary,
    HOSTNAMES_COLLECTION,
};

use crate::document::Document;
use crate::gateway::Collection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// An address scoped to the network it was observed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueIp {
    pub ip: String,
    pub network_uuid: String,
    #[serde(default)]
    pub network_name: String,
}

impl UniqueIp {
    pub fn new(ip: impl Into<String>, network_uuid: impl Into<String>, network_name: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            network_uuid: network_uuid.into(),
            network_name: network_name.into(),
        }
    }
}

/// Source of blacklist verdicts.
pub trait BlacklistLookup: Send + Sync {
    fn is_blacklisted(&self, key: &str) -> anyhow::Result<bool>;
}

impl BlacklistLookup for HashSet<String> {
    fn is_blacklisted(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.contains(key))
    }
}

/// A blacklist collection keyed by its `index` field.
impl BlacklistLookup for Collection {
    fn is_blacklisted(&self, key: &str) -> anyhow::Result<bool> {
        let mut selector = Document::new();
        selector.insert("index".into(), Value::from(key));
        Ok(self.count_documents(&selector)? > 0)
    }
}
