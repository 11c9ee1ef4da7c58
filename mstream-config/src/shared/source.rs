use serde::{Deserialize, Serialize};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Connection settings for the MongoDB deployment being replicated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MongoConfig {
    /// Connection string, including credentials and driver options.
    pub url: SerializableSecretString,
    /// Database holding the replicated collections and, when configured, the state collections.
    pub database: String,
}

impl MongoConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::MissingSourceUrl);
        }

        if self.database.trim().is_empty() {
            return Err(ValidationError::MissingDatabase);
        }

        Ok(())
    }
}
