//! Ingestion engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use canopy_connectors::firehose::source_config::duration_millis;
use canopy_connectors::firehose::FirehoseSourceConfig;
use canopy_connectors::ConnectorConfig;
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Record collections ingested when none are configured.
pub const DEFAULT_COLLECTIONS: [&str; 4] = [
    "org.example.occurrence",
    "org.example.identification",
    "org.example.comment",
    "org.example.interaction",
];

fn default_collections() -> Vec<String> {
    DEFAULT_COLLECTIONS.iter().map(ToString::to_string).collect()
}

const fn default_checkpoint_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_recent_events_capacity() -> usize {
    10
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("canopy-cursor.json")
}

/// Configuration for the [`Orchestrator`](crate::Orchestrator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Firehose connection settings.
    pub source: FirehoseSourceConfig,

    /// Allow-list of record collections to route.
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,

    /// How often the cursor is checkpointed.
    #[serde(default = "default_checkpoint_interval", with = "duration_millis")]
    pub checkpoint_interval: Duration,

    /// Size of the recent-events ring buffer.
    #[serde(default = "default_recent_events_capacity")]
    pub recent_events_capacity: usize,

    /// Where the file checkpoint store keeps the cursor.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

impl IngestConfig {
    /// Creates a config for `relay_url` with defaults everywhere else.
    #[must_use]
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            source: FirehoseSourceConfig::new(relay_url),
            collections: default_collections(),
            checkpoint_interval: default_checkpoint_interval(),
            recent_events_capacity: default_recent_events_capacity(),
            checkpoint_path: default_checkpoint_path(),
        }
    }

    /// Builds an [`IngestConfig`] from a flat [`ConnectorConfig`].
    ///
    /// Source keys are read by [`FirehoseSourceConfig::from_config`]; this
    /// adds `collections` (comma-separated), `checkpoint.interval.ms`,
    /// `recent.events.capacity` and `checkpoint.path`.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Connector` for missing or unparseable keys and
    /// `IngestError::Config` for values that fail validation.
    pub fn from_config(config: &ConnectorConfig) -> Result<Self, IngestError> {
        let source = FirehoseSourceConfig::from_config(config)?;

        let collections = match config.get("collections") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string)
                .collect(),
            None => default_collections(),
        };

        let checkpoint_interval = config
            .get_parsed::<u64>("checkpoint.interval.ms")?
            .map_or_else(default_checkpoint_interval, Duration::from_millis);
        let recent_events_capacity = config
            .get_parsed("recent.events.capacity")?
            .unwrap_or(default_recent_events_capacity());
        let checkpoint_path = config
            .get("checkpoint.path")
            .map_or_else(default_checkpoint_path, PathBuf::from);

        let parsed = Self {
            source,
            collections,
            checkpoint_interval,
            recent_events_capacity,
            checkpoint_path,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Checks values that would make the engine unusable.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), IngestError> {
        self.source.validate()?;
        if self.collections.is_empty() {
            return Err(IngestError::Config(
                "at least one collection is required".into(),
            ));
        }
        if self.checkpoint_interval.is_zero() {
            return Err(IngestError::Config(
                "checkpoint.interval.ms must be greater than zero".into(),
            ));
        }
        if self.recent_events_capacity == 0 {
            return Err(IngestError::Config(
                "recent.events.capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
