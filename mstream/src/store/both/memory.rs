use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, MstreamResult};
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{DumpProgress, ResumeMarker};

#[derive(Debug, Default)]
struct Inner {
    resume_markers: HashMap<String, ResumeMarker>,
    dump_progress: HashMap<String, DumpProgress>,
    marker_writes: HashMap<String, usize>,
    fail_reads: bool,
}

/// In-memory implementation of both stores, used by tests and ephemeral runs.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Makes every subsequent read fail with an I/O error.
    pub async fn fail_reads(&self, fail: bool) {
        let mut inner = self.inner.lock().await;
        inner.fail_reads = fail;
    }

    /// Returns the stored marker without going through the failure injection.
    pub async fn stored_resume_marker(&self, collection: &str) -> Option<ResumeMarker> {
        let inner = self.inner.lock().await;
        inner.resume_markers.get(collection).cloned()
    }

    pub async fn stored_dump_progress(&self, collection: &str) -> Option<DumpProgress> {
        let inner = self.inner.lock().await;
        inner.dump_progress.get(collection).cloned()
    }

    /// Number of marker writes, including deletions, issued for `collection`.
    pub async fn resume_marker_writes(&self, collection: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.marker_writes.get(collection).copied().unwrap_or(0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumePositionStore for MemoryStore {
    async fn get_resume_marker(&self, collection: &str) -> MstreamResult<Option<ResumeMarker>> {
        let inner = self.inner.lock().await;
        if inner.fail_reads {
            bail!(
                ErrorKind::IoError,
                "Resume marker read failed",
                format!("injected failure for `{collection}`")
            );
        }

        Ok(inner.resume_markers.get(collection).cloned())
    }

    async fn write_resume_marker(
        &self,
        collection: &str,
        marker: Option<&ResumeMarker>,
    ) -> MstreamResult<()> {
        let mut inner = self.inner.lock().await;
        *inner.marker_writes.entry(collection.to_owned()).or_default() += 1;

        match marker {
            Some(marker) => {
                inner
                    .resume_markers
                    .insert(collection.to_owned(), marker.clone());
            }
            None => {
                inner.resume_markers.remove(collection);
            }
        }

        Ok(())
    }
}

impl DumpProgressStore for MemoryStore {
    async fn get_dump_progress(&self, collection: &str) -> MstreamResult<Option<DumpProgress>> {
        let inner = self.inner.lock().await;
        if inner.fail_reads {
            bail!(
                ErrorKind::IoError,
                "Dump progress read failed",
                format!("injected failure for `{collection}`")
            );
        }

        Ok(inner
            .dump_progress
            .get(collection)
            .cloned()
            .map(DumpProgress::loaded))
    }

    async fn write_dump_progress(
        &self,
        collection: &str,
        progress: &DumpProgress,
    ) -> MstreamResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .dump_progress
            .insert(collection.to_owned(), progress.clone());

        Ok(())
    }

    async fn reset_dump_progress(&self, collection: &str) -> MstreamResult<DumpProgress> {
        let progress = DumpProgress::default();
        self.write_dump_progress(collection, &progress).await?;

        Ok(progress)
    }
}
