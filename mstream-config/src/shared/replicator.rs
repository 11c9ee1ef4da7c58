use serde::{Deserialize, Serialize};

use crate::load::Config;
use crate::shared::{
    DEFAULT_MAPPING_KEY, ElasticsearchConfig, MappingConfig, MongoConfig, ReplicationConfig,
    ValidationError,
};

/// Complete configuration of the replicator service, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ReplicatorConfig {
    pub source: MongoConfig,
    pub destination: ElasticsearchConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate()?;
        self.destination.validate()?;
        self.replication.validate()
    }

    /// Replication settings with the fallback `default` mapping filled in from the database name.
    pub fn effective_replication(&self) -> ReplicationConfig {
        let mut replication = self.replication.clone();
        replication
            .mappings
            .entry(DEFAULT_MAPPING_KEY.to_owned())
            .or_insert_with(|| MappingConfig::fallback(&self.source.database));

        replication
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["replication.collections"];
}
