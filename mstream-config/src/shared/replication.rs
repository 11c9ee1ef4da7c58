use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::shared::{
    BatchConfig, MappingsConfig, RetryConfig, StoreConfig, ValidationError,
};

/// Replication engine settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicationConfig {
    /// Collections replicated from startup.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Milliseconds between two writes of every collection's resume marker.
    #[serde(default = "default_resume_marker_interval_ms")]
    pub resume_marker_interval_ms: u64,
    /// Start change streams from "now" instead of the stored resume markers.
    #[serde(default)]
    pub ignore_resume_markers_on_start: bool,
    /// Dump every configured collection at startup, resuming from stored progress.
    #[serde(default)]
    pub dump_on_start: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub mappings: MappingsConfig,
    #[serde(default)]
    pub feed_retry: RetryConfig,
}

fn default_resume_marker_interval_ms() -> u64 {
    60_000
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch.bulk_size == 0 {
            return Err(ValidationError::BulkSizeZero);
        }

        if self.batch.idle_flush_ms == 0 {
            return Err(ValidationError::IdleFlushIntervalZero);
        }

        if self.resume_marker_interval_ms == 0 {
            return Err(ValidationError::ResumeMarkerIntervalZero);
        }

        let mut seen = HashSet::new();
        for collection in &self.collections {
            if !seen.insert(collection.as_str()) {
                return Err(ValidationError::DuplicateCollection(collection.clone()));
            }
        }

        for (collection, mapping) in &self.mappings {
            mapping.validate(collection)?;
        }

        Ok(())
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            batch: BatchConfig::default(),
            resume_marker_interval_ms: default_resume_marker_interval_ms(),
            ignore_resume_markers_on_start: false,
            dump_on_start: false,
            store: StoreConfig::default(),
            mappings: MappingsConfig::default(),
            feed_retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_collections() {
        let config = ReplicationConfig {
            collections: vec!["users".to_owned(), "orders".to_owned(), "users".to_owned()],
            ..ReplicationConfig::default()
        };

        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateCollection("users".to_owned()))
        );
    }

    #[test]
    fn rejects_zero_bulk_size() {
        let mut config = ReplicationConfig::default();
        config.batch.bulk_size = 0;

        assert_eq!(config.validate(), Err(ValidationError::BulkSizeZero));
    }
}
