use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Elasticsearch connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ElasticsearchConfig {
    /// Base url of the cluster, e.g. `http://localhost:9200`.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SerializableSecretString>,
    /// Version of the cluster API, e.g. `7.10`. Controls bulk metadata field names and whether
    /// each collection gets its own index.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Keep-alive of scroll contexts used to enumerate indexed documents.
    #[serde(default = "default_scroll_keep_alive")]
    pub scroll_keep_alive: String,
}

fn default_api_version() -> String {
    "7.10".to_owned()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_scroll_keep_alive() -> String {
    "1m".to_owned()
}

impl ElasticsearchConfig {
    /// Major component of [`ElasticsearchConfig::api_version`].
    pub fn api_major_version(&self) -> Result<u32, ValidationError> {
        parse_api_major_version(&self.api_version)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.api_major_version()?;

        Ok(())
    }
}

/// Parses the major component of versions like `7`, `6.8` or `5.6.16`.
pub fn parse_api_major_version(version: &str) -> Result<u32, ValidationError> {
    version
        .trim()
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .ok_or_else(|| ValidationError::InvalidApiVersion(version.to_owned()))
}
