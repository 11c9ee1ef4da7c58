use std::collections::HashMap;
use std::sync::Arc;

use mstream_config::shared::MappingsConfig;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::conversions::version::{increment_version_for_deletion, version_as_integer};
use crate::destination::{BulkAction, BulkOperation, BulkUnit, Destination, StoredDocumentMeta};
use crate::error::MstreamResult;
use crate::router::{CustomTransform, ResolvedMapping};
use crate::types::{Document, MutationKind, MutationRecord};

/// First cluster major version that allows a single mapping type per index.
const DISTINCT_INDEX_NAMES_SINCE: u32 = 6;

/// Renders a parent reference as a document id.
fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(object) => object.get("$oid").and_then(value_as_id),
        _ => None,
    }
}

/// Maps collections to their index and turns mutation records into bulk units.
///
/// Mappings are resolved lazily on first use and cached for the lifetime of the router.
#[derive(Debug)]
pub struct IndexRouter<D> {
    destination: D,
    mappings: MappingsConfig,
    distinct_index_names: bool,
    resolved: RwLock<HashMap<String, Arc<ResolvedMapping>>>,
    custom_transforms: RwLock<HashMap<String, CustomTransformEntry>>,
}

#[derive(Clone)]
struct CustomTransformEntry(CustomTransform);

impl std::fmt::Debug for CustomTransformEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomTransform")
    }
}

impl<D> IndexRouter<D>
where
    D: Destination + Send + Sync,
{
    pub fn new(mappings: MappingsConfig, api_major_version: u32, destination: D) -> Self {
        Self {
            destination,
            mappings,
            distinct_index_names: api_major_version >= DISTINCT_INDEX_NAMES_SINCE,
            resolved: RwLock::new(HashMap::new()),
            custom_transforms: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a transformation for `collection` that replaces any configured patch.
    pub async fn register_transform(&self, collection: &str, transform: CustomTransform) {
        self.custom_transforms
            .write()
            .await
            .insert(collection.to_owned(), CustomTransformEntry(transform));
        self.resolved.write().await.remove(collection);
    }

    pub async fn resolve_mapping(&self, collection: &str) -> MstreamResult<Arc<ResolvedMapping>> {
        if let Some(mapping) = self.resolved.read().await.get(collection) {
            return Ok(mapping.clone());
        }

        let custom_transform = self
            .custom_transforms
            .read()
            .await
            .get(collection)
            .map(|entry| entry.0.clone());
        let mapping = Arc::new(ResolvedMapping::resolve(
            collection,
            &self.mappings,
            self.distinct_index_names,
            custom_transform,
        )?);
        debug!(collection, index = %mapping.target.index, "resolved index mapping");

        // A concurrent resolution of the same collection produced an identical mapping.
        let mut resolved = self.resolved.write().await;
        Ok(resolved
            .entry(collection.to_owned())
            .or_insert(mapping)
            .clone())
    }

    /// Builds the bulk unit for `record`.
    ///
    /// Returns `None` for records that produce no write: invalidations, skipped changes, upserts
    /// without a document and documents missing their declared parent field.
    pub async fn build_action(&self, record: MutationRecord) -> MstreamResult<Option<BulkUnit>> {
        let MutationRecord {
            kind,
            collection,
            key,
            document,
        } = record;

        let Some(key) = key else {
            if !matches!(kind, MutationKind::Invalidate | MutationKind::Skipped) {
                warn!(%collection, %kind, "change without document key, skipping");
            }
            return Ok(None);
        };
        let id = key.to_string();

        match kind {
            kind if kind.is_upsert() => {
                let Some(document) = document else {
                    debug!(%collection, %id, %kind, "document no longer exists, skipping");
                    return Ok(None);
                };
                let mapping = self.resolve_mapping(&collection).await?;

                index_unit(&mapping, id, document)
            }
            MutationKind::Delete => {
                let mapping = self.resolve_mapping(&collection).await?;

                Ok(Some(self.delete_unit(&mapping, id).await))
            }
            _ => Ok(None),
        }
    }

    /// Builds a delete carrying the routing and next version of the indexed copy.
    async fn delete_unit(&self, mapping: &ResolvedMapping, id: String) -> BulkUnit {
        let stored = match self
            .destination
            .find_document(&mapping.target, &id, mapping.is_versioned())
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                error!(
                    collection = %mapping.collection,
                    %id,
                    error = %err,
                    "failed to look up the indexed document before deleting it"
                );
                None
            }
        };

        let (parent, version) = stored
            .map(|stored| (stored.parent, stored.version))
            .unwrap_or_default();

        delete_unit(mapping, id, parent, version)
    }
}

/// Builds the index unit of a document of `mapping`'s collection.
pub fn index_unit(
    mapping: &ResolvedMapping,
    id: String,
    document: Document,
) -> MstreamResult<Option<BulkUnit>> {
    let parent = match &mapping.parent_field {
        Some(field) => match document.get(field).and_then(value_as_id) {
            Some(parent) => Some(parent),
            None => {
                warn!(
                    collection = %mapping.collection,
                    %id,
                    field = %field,
                    "document has no value for its parent field, skipping"
                );
                return Ok(None);
            }
        },
        None => None,
    };

    let version = mapping
        .version_field
        .as_ref()
        .and_then(|field| document.get(field))
        .and_then(version_as_integer);

    let document = mapping.transform_document(document)?;
    let action = BulkAction {
        operation: BulkOperation::Index,
        index: mapping.target.index.clone(),
        doc_type: mapping.target.doc_type.clone(),
        id,
        parent,
        version,
        version_type: version.and(mapping.version_type),
    };

    Ok(Some(BulkUnit::index(action, document)))
}

fn delete_unit(
    mapping: &ResolvedMapping,
    id: String,
    parent: Option<String>,
    version: Option<i64>,
) -> BulkUnit {
    let version = increment_version_for_deletion(version);

    BulkUnit::delete(BulkAction {
        operation: BulkOperation::Delete,
        index: mapping.target.index.clone(),
        doc_type: mapping.target.doc_type.clone(),
        id,
        parent,
        version,
        version_type: version.and(mapping.version_type),
    })
}

/// Builds the deletes removing every document of a scroll page.
pub fn purge_units(mapping: &ResolvedMapping, hits: Vec<StoredDocumentMeta>) -> Vec<BulkUnit> {
    hits.into_iter()
        .map(|hit| delete_unit(mapping, hit.id, hit.parent, hit.version))
        .collect()
}

#[cfg(test)]
mod tests {
    use mstream_config::shared::VersionType;
    use serde_json::json;

    use super::*;
    use crate::destination::memory::MemoryDestination;
    use crate::types::DocumentKey;

    fn document(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn router(destination: MemoryDestination) -> IndexRouter<MemoryDestination> {
        let mappings = serde_json::from_value(json!({
            "default": {"index": "shop", "type": "$self"},
            "orders": {
                "parent_field": "customerId",
                "parent_type": "customers",
                "version_field": "updatedAt",
                "version_type": "external",
            },
        }))
        .unwrap();

        IndexRouter::new(mappings, 5, destination)
    }

    #[tokio::test]
    async fn upserts_carry_parent_and_version() {
        let router = router(MemoryDestination::new());
        let record = MutationRecord::insert(
            "orders",
            DocumentKey::Int(42),
            document(json!({"customerId": 7, "updatedAt": "2023-11-14T22:13:20Z"})),
        );

        let unit = router.build_action(record).await.unwrap().unwrap();

        assert_eq!(unit.action.operation, BulkOperation::Index);
        assert_eq!(unit.action.index, "shop");
        assert_eq!(unit.action.doc_type.as_deref(), Some("orders"));
        assert_eq!(unit.action.id, "42");
        assert_eq!(unit.action.parent.as_deref(), Some("7"));
        assert_eq!(unit.action.version, Some(1_700_000_000_000));
        assert_eq!(unit.action.version_type, Some(VersionType::External));
        assert_eq!(unit.line_count(), 2);
    }

    #[tokio::test]
    async fn other_key_types_use_their_display_id() {
        let router = router(MemoryDestination::new());
        let record = MutationRecord::insert(
            "customers",
            DocumentKey::Other {
                id: "1.5".to_owned(),
                extended_json: r#"{"$numberDouble":"1.5"}"#.to_owned(),
            },
            document(json!({"name": "Ada"})),
        );

        let unit = router.build_action(record).await.unwrap().unwrap();
        assert_eq!(unit.action.id, "1.5");
    }

    #[tokio::test]
    async fn missing_parent_skips_the_record() {
        let router = router(MemoryDestination::new());
        let record = MutationRecord::insert(
            "orders",
            DocumentKey::Int(42),
            document(json!({"updatedAt": 3})),
        );

        assert!(router.build_action(record).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_use_the_indexed_routing_and_next_version() {
        let destination = MemoryDestination::new();
        destination
            .put_document("shop", "42", Document::new(), Some("7".to_owned()), 12)
            .await;
        let router = router(destination.clone());

        let unit = router
            .build_action(MutationRecord::delete("orders", DocumentKey::Int(42)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(unit.action.operation, BulkOperation::Delete);
        assert_eq!(unit.action.parent.as_deref(), Some("7"));
        assert_eq!(unit.action.version, Some(13));
        assert_eq!(unit.line_count(), 1);
        assert_eq!(destination.lookups().await, 1);
    }

    #[tokio::test]
    async fn unversioned_delete_of_unknown_document_has_no_version() {
        let router = router(MemoryDestination::new());

        let unit = router
            .build_action(MutationRecord::delete("customers", DocumentKey::Int(1)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(unit.action.version, None);
        assert_eq!(unit.action.version_type, None);
        assert_eq!(unit.action.doc_type.as_deref(), Some("customers"));
    }

    #[tokio::test]
    async fn invalidations_skips_and_lookup_misses_produce_nothing() {
        let router = router(MemoryDestination::new());

        assert!(
            router
                .build_action(MutationRecord::invalidate("orders"))
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            router
                .build_action(MutationRecord::skipped("orders"))
                .await
                .unwrap()
                .is_none()
        );

        let mut update = MutationRecord::update("customers", DocumentKey::Int(1), Document::new());
        update.document = None;
        assert!(router.build_action(update).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mappings_are_cached_until_a_transform_is_registered() {
        let router = router(MemoryDestination::new());

        let first = router.resolve_mapping("customers").await.unwrap();
        let second = router.resolve_mapping("customers").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        router
            .register_transform(
                "customers",
                Arc::new(|document: Document| -> MstreamResult<Document> { Ok(document) }),
            )
            .await;
        let third = router.resolve_mapping("customers").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn purge_units_bump_versions() {
        let mapping = ResolvedMapping::resolve(
            "orders",
            &serde_json::from_value(json!({
                "orders": {"index": "shop", "version_field": "v", "version_type": "external"},
            }))
            .unwrap(),
            false,
            None,
        )
        .unwrap();

        let units = purge_units(
            &mapping,
            vec![StoredDocumentMeta {
                id: "1".to_owned(),
                parent: None,
                version: Some(4),
            }],
        );

        assert_eq!(units[0].action.version, Some(5));
        assert_eq!(units[0].action.version_type, Some(VersionType::External));
    }
}
