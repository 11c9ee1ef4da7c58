use std::future::Future;

use crate::error::MstreamResult;
use crate::types::DumpProgress;

/// Durable storage of the dump progress of each collection.
pub trait DumpProgressStore {
    /// Returns the stored progress of `collection`, or `None` if no dump ever ran.
    fn get_dump_progress(
        &self,
        collection: &str,
    ) -> impl Future<Output = MstreamResult<Option<DumpProgress>>> + Send;

    fn write_dump_progress(
        &self,
        collection: &str,
        progress: &DumpProgress,
    ) -> impl Future<Output = MstreamResult<()>> + Send;

    /// Stores and returns a zero progress for `collection`, so the next dump starts over.
    fn reset_dump_progress(
        &self,
        collection: &str,
    ) -> impl Future<Output = MstreamResult<DumpProgress>> + Send;
}
