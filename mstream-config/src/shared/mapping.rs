use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Mapping key whose `index` and `type` apply to collections without their own value.
pub const DEFAULT_MAPPING_KEY: &str = "default";

/// Placeholder replaced by the collection name in `index` and `type`.
pub const SELF_PLACEHOLDER: &str = "$self";

/// Mapping table keyed by collection name, plus the optional [`DEFAULT_MAPPING_KEY`] entry.
pub type MappingsConfig = HashMap<String, MappingConfig>;

/// How a collection is written to Elasticsearch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MappingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<String>,
    /// Document field holding the id of the parent document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_type: Option<String>,
    /// Document field holding the external version (integer or date).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_type: Option<VersionType>,
    /// Top level fields to keep; every other field is dropped before indexing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    /// RFC 6902 JSON patch applied to each document before indexing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformations: Option<serde_json::Value>,
}

impl MappingConfig {
    /// Mapping used when the configuration has no [`DEFAULT_MAPPING_KEY`] entry.
    pub fn fallback(database: &str) -> Self {
        Self {
            index: Some(database.to_owned()),
            doc_type: Some(SELF_PLACEHOLDER.to_owned()),
            ..Self::default()
        }
    }

    pub fn validate(&self, collection: &str) -> Result<(), ValidationError> {
        if self.parent_type.is_some() && self.parent_field.is_none() {
            return Err(ValidationError::ParentTypeWithoutField(
                collection.to_owned(),
            ));
        }

        if self.version_type.is_some() && self.version_field.is_none() {
            return Err(ValidationError::VersionTypeWithoutField(
                collection.to_owned(),
            ));
        }

        if let Some(transformations) = &self.transformations
            && !transformations.is_array()
        {
            return Err(ValidationError::InvalidTransformations(
                collection.to_owned(),
            ));
        }

        Ok(())
    }
}

/// Elasticsearch version types accepted on bulk operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionType {
    Internal,
    External,
    ExternalGte,
    Force,
}

impl VersionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionType::Internal => "internal",
            VersionType::External => "external",
            VersionType::ExternalGte => "external_gte",
            VersionType::Force => "force",
        }
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_uses_database_and_self_type() {
        let mapping = MappingConfig::fallback("shop");

        assert_eq!(mapping.index.as_deref(), Some("shop"));
        assert_eq!(mapping.doc_type.as_deref(), Some(SELF_PLACEHOLDER));
        assert!(mapping.parent_field.is_none());
    }

    #[test]
    fn version_type_requires_version_field() {
        let mapping = MappingConfig {
            version_type: Some(VersionType::External),
            ..MappingConfig::default()
        };

        assert_eq!(
            mapping.validate("orders"),
            Err(ValidationError::VersionTypeWithoutField("orders".to_owned()))
        );
    }

    #[test]
    fn deserializes_type_keyword() {
        let mapping: MappingConfig = serde_json::from_str(
            r#"{"index": "shop", "type": "$self", "version_field": "updatedAt", "version_type": "external_gte"}"#,
        )
        .unwrap();

        assert_eq!(mapping.doc_type.as_deref(), Some("$self"));
        assert_eq!(mapping.version_type, Some(VersionType::ExternalGte));
    }
}
