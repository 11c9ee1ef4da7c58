use std::fmt;
use std::sync::Arc;

use mstream_config::shared::{
    DEFAULT_MAPPING_KEY, MappingConfig, MappingsConfig, SELF_PLACEHOLDER, VersionType,
};
use serde::Serialize;
use serde_json::Value;

use crate::destination::IndexTarget;
use crate::error::{ErrorKind, MstreamResult};
use crate::types::Document;
use crate::{bail, mstream_error};

/// User supplied document transformation, registered per collection in code.
pub type CustomTransform = Arc<dyn Fn(Document) -> MstreamResult<Document> + Send + Sync>;

/// Transformation applied to each document after the field allow-list.
#[derive(Clone, Default)]
pub enum Transform {
    #[default]
    Identity,
    Patch(json_patch::Patch),
    Custom(CustomTransform),
}

impl Transform {
    pub fn apply(&self, document: Document) -> MstreamResult<Document> {
        match self {
            Transform::Identity => Ok(document),
            Transform::Patch(patch) => {
                let mut value = Value::Object(document);
                json_patch::patch(&mut value, &patch.0)?;

                match value {
                    Value::Object(document) => Ok(document),
                    other => bail!(
                        ErrorKind::TransformationFailed,
                        "Transformation did not produce an object",
                        other
                    ),
                }
            }
            Transform::Custom(transform) => transform(document),
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Identity => f.write_str("Identity"),
            Transform::Patch(patch) => f.debug_tuple("Patch").field(&patch.0.len()).finish(),
            Transform::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Mapping of one collection with defaults applied and `$self` expanded.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedMapping {
    pub collection: String,
    pub target: IndexTarget,
    pub parent_field: Option<String>,
    pub parent_type: Option<String>,
    pub version_field: Option<String>,
    pub version_type: Option<VersionType>,
    pub fields: Option<Vec<String>>,
    #[serde(skip)]
    pub transform: Transform,
}

impl ResolvedMapping {
    /// Resolves the mapping of `collection` from the configured table.
    ///
    /// `index` and `type` fall back to the [`DEFAULT_MAPPING_KEY`] entry. With
    /// `distinct_index_names`, the collection name is appended to the index since clusters from
    /// version 6 on allow a single type per index.
    pub fn resolve(
        collection: &str,
        mappings: &MappingsConfig,
        distinct_index_names: bool,
        custom_transform: Option<CustomTransform>,
    ) -> MstreamResult<Self> {
        let own = mappings.get(collection).cloned().unwrap_or_default();
        let default = mappings.get(DEFAULT_MAPPING_KEY);

        let expand = |value: String| {
            if value == SELF_PLACEHOLDER {
                collection.to_owned()
            } else {
                value
            }
        };

        let MappingConfig {
            index,
            doc_type,
            parent_field,
            parent_type,
            version_field,
            version_type,
            fields,
            transformations,
        } = own;

        let Some(index) = index
            .or_else(|| default.and_then(|default| default.index.clone()))
            .map(expand)
        else {
            bail!(
                ErrorKind::MissingMapping,
                "No index is configured for the collection",
                collection
            );
        };
        let doc_type = doc_type
            .or_else(|| default.and_then(|default| default.doc_type.clone()))
            .map(expand);
        let index = if distinct_index_names {
            format!("{index}-{collection}")
        } else {
            index
        };

        let transform = match (custom_transform, transformations) {
            (Some(custom), _) => Transform::Custom(custom),
            (None, Some(transformations)) => {
                let patch = serde_json::from_value::<json_patch::Patch>(transformations)
                    .map_err(|err| {
                        mstream_error!(
                            ErrorKind::ConfigError,
                            "Invalid transformations for the collection",
                            format!("{collection}: {err}")
                        )
                    })?;
                Transform::Patch(patch)
            }
            (None, None) => Transform::Identity,
        };

        Ok(Self {
            collection: collection.to_owned(),
            target: IndexTarget { index, doc_type },
            parent_field,
            parent_type,
            version_field,
            version_type,
            fields,
            transform,
        })
    }

    /// Keeps the allowed fields, then applies the configured transformation.
    pub fn transform_document(&self, mut document: Document) -> MstreamResult<Document> {
        if let Some(fields) = &self.fields {
            document.retain(|field, _| fields.iter().any(|allowed| allowed == field));
        }

        self.transform.apply(document)
    }

    pub fn is_versioned(&self) -> bool {
        self.version_type.is_some()
    }
}
