//! Unified configuration for flowsink components.
//!
//! Configuration is loaded with precedence: Overrides > Env vars > Config file > Defaults
//!
//! # Example config file (flowsink.toml)
//! ```toml
//! [store]
//! database = "dataset-2024-06-01"
//!
//! [writer]
//! max_count = 500
//! max_size = 15000000
//!
//! [pipeline]
//! workers = 8
//!
//! [rolling]
//! current_chunk = 3
//! ```
//!
//! Environment variables use the `FLOWSINK_` prefix with `__` between nested
//! keys, e.g. `FLOWSINK_WRITER__MAX_COUNT=250`.

pub mod defaults;

pub use defaults::*;

use crate::document::ChunkId;
use crate::pipeline::PipelineConfig;
use crate::retraction::RetractionConfig;
use crate::writer::BulkWriterConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Main configuration for flowsink components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowsinkConfig {
    /// Document store selection
    pub store: StoreConfig,
    /// Bulk writer batching thresholds
    pub writer: BulkWriterConfig,
    /// Pipeline stage worker pool
    pub pipeline: PipelineConfig,
    /// Chunk retraction
    pub retraction: RetractionConfig,
    /// Rolling dataset state
    pub rolling: RollingConfig,
    /// Log output
    pub logging: LoggingConfig,
}

impl FlowsinkConfig {
    /// Load configuration with precedence: Overrides > Env > File > Defaults
    ///
    /// The result is validated before it is returned.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(FlowsinkConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with FLOWSINK_ prefix
        figment = figment.merge(Env::prefixed("FLOWSINK_").split("__"));

        // Layer 3: Explicit overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: Self = figment.extract().map_err(|err| ConfigError::Load(Box::new(err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject settings the write path cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.writer.max_count == 0 {
            return Err(ConfigError::invalid("writer.max_count", "must be at least 1"));
        }
        if self.writer.max_size == 0 {
            return Err(ConfigError::invalid("writer.max_size", "must be at least 1 byte"));
        }
        if self.writer.max_size >= self.store.payload_limit {
            return Err(ConfigError::invalid(
                "writer.max_size",
                format!(
                    "{} must stay below the {} byte store payload limit",
                    self.writer.max_size, self.store.payload_limit
                ),
            ));
        }
        if self.retraction.workers == 0 {
            return Err(ConfigError::invalid("retraction.workers", "must be at least 1"));
        }
        if self.retraction.tag_field.is_empty() || self.retraction.history_field.is_empty() {
            return Err(ConfigError::invalid(
                "retraction",
                "tag_field and history_field must be set",
            ));
        }
        if self.store.database.is_empty() {
            return Err(ConfigError::invalid("store.database", "must not be empty"));
        }
        Ok(())
    }
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Working database of the current dataset
    pub database: String,
    /// Per-operation payload ceiling of the store in bytes
    pub payload_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            payload_limit: STORE_PAYLOAD_LIMIT,
        }
    }
}

/// Rolling dataset configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Chunk every write of this run is stamped with
    pub current_chunk: ChunkId,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive, used when `RUST_LOG` is unset
    pub filter: String,
    /// Colourise output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            ansi: true,
        }
    }
}

/// Explicit overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writer: Option<WriterOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolling: Option<RollingOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordered: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RollingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<ChunkId>,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(Box<figment::Error>),
    #[error("configuration error: `{field}` {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Load(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = FlowsinkConfig::default();
        assert_eq!(config.store.database, DEFAULT_DATABASE);
        assert_eq!(config.writer.max_count, DEFAULT_BULK_MAX_COUNT);
        assert_eq!(config.writer.max_size, DEFAULT_BULK_MAX_SIZE);
        assert_eq!(config.writer.channel_capacity, 0);
        assert!(!config.writer.ordered);
        assert_eq!(config.retraction.tag_field, "cid");
        assert_eq!(config.retraction.history_field, "dat");
        assert_eq!(config.rolling.current_chunk, ChunkId(0));
        config.validate().unwrap();
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[store]\ndatabase = \"dataset-a\"\n\n[writer]\nmax_count = 100\n\n[rolling]\ncurrent_chunk = 4"
        )
        .unwrap();

        let overrides = ConfigOverrides {
            writer: Some(WriterOverrides {
                max_count: Some(10),
                ..WriterOverrides::default()
            }),
            ..ConfigOverrides::default()
        };
        let config = FlowsinkConfig::load(Some(file.path()), overrides).unwrap();
        assert_eq!(config.store.database, "dataset-a");
        assert_eq!(config.writer.max_count, 10);
        assert_eq!(config.writer.max_size, DEFAULT_BULK_MAX_SIZE);
        assert_eq!(config.rolling.current_chunk, ChunkId(4));
    }

    #[test]
    fn test_validation_rejects_unsafe_thresholds() {
        let mut config = FlowsinkConfig::default();
        config.writer.max_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "writer.max_count", .. })
        ));

        let mut config = FlowsinkConfig::default();
        config.writer.max_size = STORE_PAYLOAD_LIMIT;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("writer.max_size"));

        let overrides = ConfigOverrides {
            writer: Some(WriterOverrides {
                max_count: Some(0),
                ..WriterOverrides::default()
            }),
            ..ConfigOverrides::default()
        };
        assert!(FlowsinkConfig::load(None, overrides).is_err());
    }

    #[test]
    fn test_chunk_id_serde() {
        let rolling: RollingConfig = serde_json::from_str(r#"{"current_chunk": 12}"#).unwrap();
        assert_eq!(rolling.current_chunk, ChunkId(12));
    }
}
