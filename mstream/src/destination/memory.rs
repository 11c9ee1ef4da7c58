use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use mstream_config::shared::VersionType;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::bail;
use crate::destination::{
    BulkAction, BulkItemError, BulkItemResult, BulkOperation, BulkResponse, BulkUnit,
    Destination, IndexTarget, ROUTING_MISSING_EXCEPTION, ScrollPage, StoredDocumentMeta,
};
use crate::error::{ErrorKind, MstreamResult};
use crate::types::Document;

const VERSION_CONFLICT_EXCEPTION: &str = "version_conflict_engine_exception";

#[derive(Debug, Clone, PartialEq)]
struct StoredDocument {
    document: Document,
    parent: Option<String>,
    version: i64,
}

type Condition = Box<dyn Fn(&Inner) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    indices: HashMap<String, BTreeMap<String, StoredDocument>>,
    bulk_requests: Vec<Vec<BulkUnit>>,
    routing_required: HashSet<String>,
    failing_bulk_requests: usize,
    lookups: usize,
    scrolls: HashMap<String, (usize, VecDeque<StoredDocumentMeta>)>,
    next_scroll_id: u64,
    conditions: Vec<(Condition, Arc<Notify>)>,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("indices", &self.indices)
            .field("bulk_requests", &self.bulk_requests.len())
            .field("routing_required", &self.routing_required)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn check_conditions(&mut self) {
        let conditions = std::mem::take(&mut self.conditions);
        let mut pending = Vec::with_capacity(conditions.len());
        for (condition, notify) in conditions {
            if condition(self) {
                notify.notify_one();
            } else {
                pending.push((condition, notify));
            }
        }
        self.conditions = pending;
    }

    fn apply(&mut self, unit: BulkUnit) -> BulkItemResult {
        let BulkUnit { action, document } = unit;
        let mut result = BulkItemResult {
            operation: action.operation,
            index: action.index.clone(),
            id: action.id.clone(),
            status: 200,
            error: None,
        };

        if self.routing_required.contains(&action.index) && action.parent.is_none() {
            result.status = 400;
            result.error = Some(BulkItemError {
                error_type: ROUTING_MISSING_EXCEPTION.to_owned(),
                reason: format!("routing is required for [{}]/[{}]", action.index, action.id),
            });
            return result;
        }

        let documents = self.indices.entry(action.index.clone()).or_default();
        let current = documents.get(&action.id).map(|stored| stored.version);

        if let Some(conflict) = version_conflict(&action, current) {
            result.status = 409;
            result.error = Some(conflict);
            return result;
        }

        match (action.operation, document) {
            (BulkOperation::Index, Some(document)) => {
                let version = match (action.version_type, action.version) {
                    (Some(VersionType::Internal) | None, _) | (_, None) => {
                        current.map_or(1, |current| current + 1)
                    }
                    (Some(_), Some(version)) => version,
                };
                result.status = if current.is_some() { 200 } else { 201 };
                documents.insert(
                    action.id,
                    StoredDocument {
                        document,
                        parent: action.parent,
                        version,
                    },
                );
            }
            (BulkOperation::Index, None) => {
                result.status = 400;
                result.error = Some(BulkItemError {
                    error_type: "action_request_validation_exception".to_owned(),
                    reason: "index operation without a document".to_owned(),
                });
            }
            (BulkOperation::Delete, _) => {
                if documents.remove(&action.id).is_none() {
                    result.status = 404;
                }
            }
        }

        result
    }
}

fn version_conflict(action: &BulkAction, current: Option<i64>) -> Option<BulkItemError> {
    let (Some(version), Some(current)) = (action.version, current) else {
        return None;
    };

    let conflicting = match action.version_type {
        Some(VersionType::External) => version <= current,
        Some(VersionType::ExternalGte) => version < current,
        _ => false,
    };

    conflicting.then(|| BulkItemError {
        error_type: VERSION_CONFLICT_EXCEPTION.to_owned(),
        reason: format!(
            "[{}]: version conflict, current version [{current}] is higher or equal to the one provided [{version}]",
            action.id
        ),
    })
}

/// In-memory search index with bulk semantics close to Elasticsearch.
///
/// Supports external versioning, indices that require parent routing, scrolls, and injected
/// whole-request failures.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Rejects index operations on `index` that carry no parent.
    pub async fn require_routing(&self, index: &str) {
        let mut inner = self.inner.lock().await;
        inner.routing_required.insert(index.to_owned());
    }

    /// Makes the next `count` bulk requests fail as a whole.
    pub async fn fail_next_bulk_requests(&self, count: usize) {
        let mut inner = self.inner.lock().await;
        inner.failing_bulk_requests = count;
    }

    /// Stores a document directly, bypassing bulk requests.
    pub async fn put_document(
        &self,
        index: &str,
        id: &str,
        document: Document,
        parent: Option<String>,
        version: i64,
    ) {
        let mut inner = self.inner.lock().await;
        inner.indices.entry(index.to_owned()).or_default().insert(
            id.to_owned(),
            StoredDocument {
                document,
                parent,
                version,
            },
        );
    }

    pub async fn documents(&self, index: &str) -> BTreeMap<String, Document> {
        let inner = self.inner.lock().await;
        inner
            .indices
            .get(index)
            .map(|documents| {
                documents
                    .iter()
                    .map(|(id, stored)| (id.clone(), stored.document.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<Document> {
        let inner = self.inner.lock().await;
        inner
            .indices
            .get(index)
            .and_then(|documents| documents.get(id))
            .map(|stored| stored.document.clone())
    }

    pub async fn document_meta(&self, index: &str, id: &str) -> Option<StoredDocumentMeta> {
        let inner = self.inner.lock().await;
        inner
            .indices
            .get(index)
            .and_then(|documents| documents.get(id))
            .map(|stored| StoredDocumentMeta {
                id: id.to_owned(),
                parent: stored.parent.clone(),
                version: Some(stored.version),
            })
    }

    /// Every bulk request received, including failed ones, in arrival order.
    pub async fn bulk_requests(&self) -> Vec<Vec<BulkUnit>> {
        let inner = self.inner.lock().await;
        inner.bulk_requests.clone()
    }

    /// Number of single document lookups served.
    pub async fn lookups(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.lookups
    }

    /// Returns a [`Notify`] triggered once at least `count` bulk requests were received.
    pub async fn notify_on_bulk_requests(&self, count: usize) -> Arc<Notify> {
        self.notify_on(move |inner| inner.bulk_requests.len() >= count)
            .await
    }

    /// Returns a [`Notify`] triggered once `index` holds exactly `count` documents.
    pub async fn notify_on_document_count(&self, index: &str, count: usize) -> Arc<Notify> {
        let index = index.to_owned();
        self.notify_on(move |inner| {
            inner.indices.get(&index).map_or(0, |documents| documents.len()) == count
        })
        .await
    }

    async fn notify_on<F>(&self, condition: F) -> Arc<Notify>
    where
        F: Fn(&Inner) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        inner.conditions.push((Box::new(condition), notify.clone()));
        inner.check_conditions();

        notify
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

fn scroll_metas(
    documents: &BTreeMap<String, StoredDocument>,
    with_version: bool,
) -> VecDeque<StoredDocumentMeta> {
    documents
        .iter()
        .map(|(id, stored)| StoredDocumentMeta {
            id: id.clone(),
            parent: stored.parent.clone(),
            version: with_version.then_some(stored.version),
        })
        .collect()
}

impl Destination for MemoryDestination {
    async fn bulk(&self, units: Vec<BulkUnit>) -> MstreamResult<BulkResponse> {
        let mut inner = self.inner.lock().await;
        inner.bulk_requests.push(units.clone());

        if inner.failing_bulk_requests > 0 {
            inner.failing_bulk_requests -= 1;
            inner.check_conditions();
            bail!(
                ErrorKind::DestinationConnectionFailed,
                "Bulk request failed",
                "injected failure"
            );
        }

        let items = units.into_iter().map(|unit| inner.apply(unit)).collect();
        inner.check_conditions();

        Ok(BulkResponse { items })
    }

    async fn find_document(
        &self,
        target: &IndexTarget,
        id: &str,
        with_version: bool,
    ) -> MstreamResult<Option<StoredDocumentMeta>> {
        let mut inner = self.inner.lock().await;
        inner.lookups += 1;

        Ok(inner
            .indices
            .get(&target.index)
            .and_then(|documents| documents.get(id))
            .map(|stored| StoredDocumentMeta {
                id: id.to_owned(),
                parent: stored.parent.clone(),
                version: with_version.then_some(stored.version),
            }))
    }

    async fn open_scroll(
        &self,
        target: &IndexTarget,
        page_size: usize,
        with_version: bool,
    ) -> MstreamResult<ScrollPage> {
        let mut inner = self.inner.lock().await;
        let Some(documents) = inner.indices.get(&target.index) else {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "Search failed",
                format!("index_not_found_exception: no such index [{}]", target.index)
            );
        };

        let mut remaining = scroll_metas(documents, with_version);
        let total = remaining.len() as u64;
        let hits: Vec<_> = remaining
            .drain(..page_size.min(remaining.len()))
            .collect();

        inner.next_scroll_id += 1;
        let scroll_id = format!("scroll-{}", inner.next_scroll_id);
        inner
            .scrolls
            .insert(scroll_id.clone(), (page_size, remaining));
        debug!(index = %target.index, total, "opened in-memory scroll");

        Ok(ScrollPage {
            scroll_id: Some(scroll_id),
            total,
            hits,
        })
    }

    async fn next_scroll_page(&self, scroll_id: &str) -> MstreamResult<ScrollPage> {
        let mut inner = self.inner.lock().await;
        let Some((page_size, remaining)) = inner.scrolls.get_mut(scroll_id) else {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "Scroll failed",
                format!("search_context_missing_exception: no scroll [{scroll_id}]")
            );
        };

        let total = remaining.len() as u64;
        let hits: Vec<_> = remaining
            .drain(..(*page_size).min(remaining.len()))
            .collect();

        Ok(ScrollPage {
            scroll_id: Some(scroll_id.to_owned()),
            total,
            hits,
        })
    }
}
