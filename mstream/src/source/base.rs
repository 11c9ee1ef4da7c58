use std::future::Future;

use futures::stream::BoxStream;

use crate::error::MstreamResult;
use crate::types::{ChangeEvent, DocumentKey, ResumeMarker, SourceDocument};

/// Change stream of one collection.
///
/// The stream yields changes in commit order. It ends when the server closes it and yields an
/// error when it cannot continue; both are terminal.
pub type ChangeFeed = BoxStream<'static, MstreamResult<ChangeEvent>>;

/// Documents of one collection in ascending key order.
pub type DocumentCursor = BoxStream<'static, MstreamResult<SourceDocument>>;

/// A document database whose collections can be dumped and tailed.
pub trait Source {
    /// Opens the change stream of `collection` right after `resume_after`, or at the current end
    /// of the stream when `None`. Inserts, updates and replaces carry the current full document.
    fn open_change_feed(
        &self,
        collection: &str,
        resume_after: Option<ResumeMarker>,
    ) -> impl Future<Output = MstreamResult<ChangeFeed>> + Send;

    /// Counts documents of `collection` with a key greater than `after`.
    fn count_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
    ) -> impl Future<Output = MstreamResult<u64>> + Send;

    /// Opens a cursor over documents of `collection` with a key greater than `after`, in
    /// ascending key order, fetching `batch_size` documents per round trip.
    fn read_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        batch_size: u32,
    ) -> impl Future<Output = MstreamResult<DocumentCursor>> + Send;
}
