use std::fmt;
use std::future::Future;

use mstream_config::shared::VersionType;
use serde::Serialize;

use crate::error::MstreamResult;
use crate::types::Document;

/// Item error type reported when a child document is written without its parent routing.
pub const ROUTING_MISSING_EXCEPTION: &str = "routing_missing_exception";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkOperation {
    Index,
    Delete,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Index => "index",
            BulkOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for BulkOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index (and, on clusters with mapping types, type) a collection is written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndexTarget {
    pub index: String,
    pub doc_type: Option<String>,
}

/// Metadata line of a bulk operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub operation: BulkOperation,
    pub index: String,
    pub doc_type: Option<String>,
    pub id: String,
    pub parent: Option<String>,
    pub version: Option<i64>,
    pub version_type: Option<VersionType>,
}

/// One bulk operation: its metadata line, followed by the document for index operations.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUnit {
    pub action: BulkAction,
    pub document: Option<Document>,
}

impl BulkUnit {
    pub fn index(action: BulkAction, document: Document) -> Self {
        Self {
            action,
            document: Some(document),
        }
    }

    pub fn delete(action: BulkAction) -> Self {
        Self {
            action,
            document: None,
        }
    }

    /// Lines this unit occupies in a bulk body.
    pub fn line_count(&self) -> usize {
        if self.document.is_some() { 2 } else { 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemError {
    pub error_type: String,
    pub reason: String,
}

impl BulkItemError {
    pub fn is_routing_missing(&self) -> bool {
        self.error_type == ROUTING_MISSING_EXCEPTION
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BulkItemResult {
    pub operation: BulkOperation,
    pub index: String,
    pub id: String,
    pub status: u16,
    pub error: Option<BulkItemError>,
}

/// Per-item outcome of a bulk request, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResult>,
}

impl BulkResponse {
    pub fn failed_items(&self) -> impl Iterator<Item = (&BulkItemResult, &BulkItemError)> {
        self.items
            .iter()
            .filter_map(|item| item.error.as_ref().map(|error| (item, error)))
    }
}

/// Routing and version information of an indexed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocumentMeta {
    pub id: String,
    pub parent: Option<String>,
    pub version: Option<i64>,
}

/// Page of a scroll over an index.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    /// Id to fetch the next page with. `None` when the scroll is exhausted.
    pub scroll_id: Option<String>,
    /// Documents matched by the whole scroll, not only this page.
    pub total: u64,
    pub hits: Vec<StoredDocumentMeta>,
}

/// A search index that accepts bulk writes.
pub trait Destination {
    /// Sends `units` as one bulk request.
    ///
    /// An `Err` means the whole request failed; item level failures are reported in the
    /// [`BulkResponse`].
    fn bulk(&self, units: Vec<BulkUnit>) -> impl Future<Output = MstreamResult<BulkResponse>> + Send;

    /// Looks up the routing and, when `with_version` is set, the version of document `id`.
    fn find_document(
        &self,
        target: &IndexTarget,
        id: &str,
        with_version: bool,
    ) -> impl Future<Output = MstreamResult<Option<StoredDocumentMeta>>> + Send;

    /// Starts a scroll over every document of `target`, `page_size` documents per page.
    fn open_scroll(
        &self,
        target: &IndexTarget,
        page_size: usize,
        with_version: bool,
    ) -> impl Future<Output = MstreamResult<ScrollPage>> + Send;

    fn next_scroll_page(
        &self,
        scroll_id: &str,
    ) -> impl Future<Output = MstreamResult<ScrollPage>> + Send;
}
