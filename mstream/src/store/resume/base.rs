use std::future::Future;

use crate::error::MstreamResult;
use crate::types::ResumeMarker;

/// Durable storage of the change stream position of each collection.
///
/// Markers are opaque: they are written as produced by the source and handed back unchanged.
/// Implementations must be safe to call concurrently for different collections.
pub trait ResumePositionStore {
    /// Returns the stored marker of `collection`, or `None` if there is none.
    fn get_resume_marker(
        &self,
        collection: &str,
    ) -> impl Future<Output = MstreamResult<Option<ResumeMarker>>> + Send;

    /// Stores `marker` for `collection`. Writing `None` deletes the stored marker.
    fn write_resume_marker(
        &self,
        collection: &str,
        marker: Option<&ResumeMarker>,
    ) -> impl Future<Output = MstreamResult<()>> + Send;

    /// Deletes the stored marker of `collection`.
    fn reset_resume_marker(
        &self,
        collection: &str,
    ) -> impl Future<Output = MstreamResult<()>> + Send {
        self.write_resume_marker(collection, None)
    }
}
