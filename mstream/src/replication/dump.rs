use std::time::Instant;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::destination::{BulkUnit, Destination};
use crate::error::MstreamResult;
use crate::replication::{CollectionReplicator, DumpOutcome, ReplicatorPhase};
use crate::router::{index_unit, purge_units};
use crate::source::{DocumentCursor, Source};
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{DumpProgress, SourceDocument};

/// Reads the next document, treating a read error as the end of the cursor.
async fn next_document(cursor: &mut DocumentCursor, collection: &str) -> Option<SourceDocument> {
    match cursor.next().await {
        Some(Ok(document)) => Some(document),
        Some(Err(err)) => {
            error!(
                collection,
                error = %err,
                "failed to read the next document, ending the dump pass"
            );
            None
        }
        None => None,
    }
}

impl<Src, S, D> CollectionReplicator<Src, S, D>
where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub(super) async fn dump_locked(&self) -> MstreamResult<DumpOutcome> {
        let collection = self.inner.collection.as_str();
        let ctx = &self.inner.ctx;
        let bulk_size = ctx.config.batch.bulk_size;
        let max_lines = ctx.config.batch.max_buffered_lines();
        let cursor_batch_size = u32::try_from(bulk_size).unwrap_or(u32::MAX);

        let mapping = ctx.router.resolve_mapping(collection).await?;
        let mut progress = self.load_progress().await.loaded();

        if ctx.pause_gate.is_paused() {
            info!(collection, "dumps are paused, waiting before reading");
            self.set_phase(ReplicatorPhase::PausedDuringDump).await;
            ctx.pause_gate.wait_until_resumed().await;
            self.set_phase(self.phase_after_dump().await).await;
        }

        let remaining = ctx
            .source
            .count_documents_after(collection, progress.last_key.as_ref())
            .await?;
        let total = remaining + progress.count;

        let mut cursor = ctx
            .source
            .read_documents_after(collection, progress.last_key.as_ref(), cursor_batch_size)
            .await?;

        let Some(first) = next_document(&mut cursor, collection).await else {
            if let Some(completed_at) = progress.completed_at {
                info!(collection, %completed_at, "dump already finished");
                return Ok(DumpOutcome::AlreadyComplete);
            }

            progress.complete();
            self.save_progress(&progress).await;
            info!(collection, "nothing left to dump, marking the dump as finished");

            return Ok(DumpOutcome::MarkedComplete);
        };

        if progress.is_complete() {
            info!(collection, "dump was marked as finished but more documents were found");
            progress.reopen();
            self.save_progress(&progress).await;
        }

        info!(collection, total, already_dumped = progress.count, "dumping collection");
        self.set_phase(ReplicatorPhase::Dumping).await;

        let started = Instant::now();
        let mut pending = Some(first);
        let mut batch: Vec<BulkUnit> = Vec::new();
        let mut batch_lines = 0;
        let mut batch_documents = 0;
        let mut dumped = 0;

        loop {
            if ctx.pause_gate.is_paused() {
                info!(collection, "dump paused");
                self.set_phase(ReplicatorPhase::PausedDuringDump).await;
                ctx.pause_gate.wait_until_resumed().await;
                self.set_phase(ReplicatorPhase::Dumping).await;
                info!(collection, "dump resumed, reopening the cursor");

                // The pending document lies past the last key and is read again.
                pending = None;
                cursor = ctx
                    .source
                    .read_documents_after(
                        collection,
                        progress.last_key.as_ref(),
                        cursor_batch_size,
                    )
                    .await?;
            }

            let document = match pending.take() {
                Some(document) => document,
                None => match next_document(&mut cursor, collection).await {
                    Some(document) => document,
                    None => break,
                },
            };

            let SourceDocument { key, document } = document;
            progress.last_key = Some(key.clone());
            batch_documents += 1;
            dumped += 1;

            match index_unit(&mapping, key.to_string(), document) {
                Ok(Some(unit)) => {
                    batch_lines += unit.line_count();
                    batch.push(unit);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(collection, %key, error = %err, "failed to transform document, skipping");
                }
            }

            if batch_lines >= max_lines {
                progress.count += batch_documents;
                log_progress(collection, &progress, total, started);

                self.inner
                    .dispatcher
                    .dispatch(std::mem::take(&mut batch))
                    .await;
                self.save_progress(&progress).await;

                batch_lines = 0;
                batch_documents = 0;
            }
        }

        progress.count += batch_documents;
        info!(collection, count = progress.count, total, "sending the last dump request");
        self.inner.dispatcher.dispatch(batch).await;
        self.inner.dispatcher.wait_for_in_flight().await;

        progress.complete();
        self.save_progress(&progress).await;
        self.set_phase(self.phase_after_dump().await).await;

        info!(
            collection,
            documents = dumped,
            elapsed_secs = started.elapsed().as_secs(),
            "finished dumping collection"
        );

        Ok(DumpOutcome::Completed { documents: dumped })
    }

    async fn phase_after_dump(&self) -> ReplicatorPhase {
        if self.inner.state.lock().await.is_listening() {
            ReplicatorPhase::Tailing
        } else {
            ReplicatorPhase::Idle
        }
    }

    /// Deletes every document of the collection from the destination. Returns the number of
    /// deletes sent; a collection without index counts as empty.
    pub(super) async fn purge_destination(&self) -> u64 {
        let collection = self.inner.collection.as_str();
        let ctx = &self.inner.ctx;

        let mapping = match ctx.router.resolve_mapping(collection).await {
            Ok(mapping) => mapping,
            Err(err) => {
                error!(collection, error = %err, "cannot purge the destination without a mapping");
                return 0;
            }
        };

        let mut page = match ctx
            .destination
            .open_scroll(
                &mapping.target,
                ctx.config.batch.bulk_size,
                mapping.is_versioned(),
            )
            .await
        {
            Ok(page) => page,
            Err(err) => {
                info!(
                    collection,
                    index = %mapping.target.index,
                    error = %err,
                    "nothing to purge, the index cannot be searched"
                );
                return 0;
            }
        };

        let total = page.total;
        let mut deleted = 0;

        while !page.hits.is_empty() {
            let units = purge_units(&mapping, std::mem::take(&mut page.hits));
            deleted += units.len() as u64;
            info!(collection, deleted, total, "purge progress");
            self.inner.dispatcher.dispatch(units).await;

            let Some(scroll_id) = page.scroll_id.take() else {
                break;
            };
            page = match ctx.destination.next_scroll_page(&scroll_id).await {
                Ok(page) => page,
                Err(err) => {
                    error!(collection, error = %err, "failed to fetch the next page to purge");
                    break;
                }
            };
        }

        self.inner.dispatcher.wait_for_in_flight().await;

        deleted
    }
}

/// Completion estimate of a running dump.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ProgressEstimate {
    percent: f64,
    docs_per_sec: f64,
    eta_secs: f64,
}

impl ProgressEstimate {
    fn new(progress: &DumpProgress, total: u64, elapsed_secs: f64) -> Self {
        let done = progress.count.saturating_sub(progress.start_count) as f64;
        let docs_per_sec = if elapsed_secs > 0.0 {
            done / elapsed_secs
        } else {
            0.0
        };
        let eta_secs = if docs_per_sec > 0.0 {
            total.saturating_sub(progress.count) as f64 / docs_per_sec
        } else {
            0.0
        };
        let percent = if total > 0 {
            progress.count as f64 * 100.0 / total as f64
        } else {
            100.0
        };

        Self {
            percent,
            docs_per_sec,
            eta_secs,
        }
    }
}

fn log_progress(collection: &str, progress: &DumpProgress, total: u64, started: Instant) {
    let estimate = ProgressEstimate::new(progress, total, started.elapsed().as_secs_f64());

    info!(
        collection,
        count = progress.count,
        total,
        percent = %format!("{:.1}", estimate.percent),
        docs_per_sec = %format!("{:.1}", estimate.docs_per_sec),
        eta_secs = %format!("{:.1}", estimate.eta_secs),
        "dump progress"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_count_documents_of_this_pass_only() {
        let progress = DumpProgress {
            count: 60,
            start_count: 20,
            ..DumpProgress::default()
        };

        let estimate = ProgressEstimate::new(&progress, 100, 4.0);

        assert_eq!(estimate.percent, 60.0);
        assert_eq!(estimate.docs_per_sec, 10.0);
        assert_eq!(estimate.eta_secs, 4.0);
    }

    #[test]
    fn empty_collections_are_complete() {
        let estimate = ProgressEstimate::new(&DumpProgress::default(), 0, 0.0);

        assert_eq!(estimate.percent, 100.0);
        assert_eq!(estimate.docs_per_sec, 0.0);
        assert_eq!(estimate.eta_secs, 0.0);
    }
}
