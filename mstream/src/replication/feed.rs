use futures::StreamExt;
use tracing::{Instrument, debug, error, info, info_span};

use crate::concurrency::signal::{SignalRx, create_signal};
use crate::destination::Destination;
use crate::error::{MstreamError, MstreamResult};
use crate::replication::state::{FeedListener, RecoveryRequest};
use crate::replication::{CollectionReplicator, ReplicatorPhase, ResetOptions};
use crate::source::{ChangeFeed, Source};
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{ChangeEvent, MutationKind};

/// Picks the recovery for a change stream failure.
fn recovery_for(err: &MstreamError) -> (ResetOptions, bool) {
    if err.is_resume_position_lost() {
        (ResetOptions::resync(), false)
    } else {
        (ResetOptions::reconnect(), true)
    }
}

impl<Src, S, D> CollectionReplicator<Src, S, D>
where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub(super) async fn watch_locked(&self, ignore_resume_marker: bool) -> MstreamResult<()> {
        let collection = self.inner.collection.as_str();

        if self.inner.state.lock().await.retired {
            debug!(collection, "replicator removed, not opening a change stream");
            return Ok(());
        }

        if self.inner.state.lock().await.listener.is_some() {
            self.teardown_listener().await;
        }

        if ignore_resume_marker {
            self.reset_marker().await;
        }

        let marker = self.resolve_marker().await;
        info!(
            collection,
            resuming = marker.is_some(),
            "opening change stream"
        );

        let generation = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            state.generation
        };

        let feed = match self
            .inner
            .ctx
            .source
            .open_change_feed(collection, marker)
            .await
        {
            Ok(feed) => feed,
            Err(err) => {
                error!(collection, error = %err, "failed to open the change stream");
                self.request_recovery(generation, &err).await;

                return Ok(());
            }
        };

        let (stop_tx, stop_rx) = create_signal();
        let span = info_span!("change_stream", collection, generation);
        let handle = tokio::spawn(
            run_listener(self.clone(), feed, stop_rx, generation).instrument(span),
        );

        let mut state = self.inner.state.lock().await;
        if state.retired {
            // Removed while the stream was opening.
            handle.abort();
            return Ok(());
        }

        state.listener = Some(FeedListener { stop_tx, handle });
        state.phase = match state.phase {
            ReplicatorPhase::Dumping | ReplicatorPhase::PausedDuringDump => state.phase,
            _ => ReplicatorPhase::Tailing,
        };

        Ok(())
    }

    async fn request_recovery(&self, generation: u64, err: &MstreamError) {
        let (options, transient) = recovery_for(err);

        {
            let mut state = self.inner.state.lock().await;
            state.phase = ReplicatorPhase::Error;
            if transient {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        }

        self.send_recovery(RecoveryRequest {
            generation,
            options,
            transient,
        });
    }

    fn send_recovery(&self, request: RecoveryRequest) {
        if self.inner.recovery_tx.send(request).is_err() {
            debug!(
                collection = %self.inner.collection,
                "recovery task is gone, dropping recovery request"
            );
        }
    }

    /// Records the position of `event` and forwards its change to the dispatcher.
    async fn handle_change(&self, event: ChangeEvent) {
        let ChangeEvent { position, record } = event;
        debug!(
            collection = %self.inner.collection,
            kind = %record.kind,
            key = ?record.key,
            "replicating change"
        );

        {
            let mut state = self.inner.state.lock().await;
            state.marker = Some(position);
            state.marker_loaded = true;
            state.consecutive_failures = 0;
        }

        match self.inner.ctx.router.build_action(record).await {
            Ok(Some(unit)) => self.inner.dispatcher.add(unit).await,
            Ok(None) => {}
            Err(err) => {
                error!(
                    collection = %self.inner.collection,
                    error = %err,
                    "failed to build the bulk operation of a change, skipping"
                );
            }
        }
    }
}

/// Consumes a change stream until it ends, fails or is asked to stop.
async fn run_listener<Src, S, D>(
    replicator: CollectionReplicator<Src, S, D>,
    mut feed: ChangeFeed,
    mut stop_rx: SignalRx,
    generation: u64,
) where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    loop {
        let item = tokio::select! {
            biased;

            _ = stop_rx.changed() => {
                debug!("change stream listener asked to stop");
                return;
            }
            item = feed.next() => item,
        };

        match item {
            Some(Ok(event)) if event.record.kind == MutationKind::Invalidate => {
                info!("change stream invalidated, resyncing the collection");
                {
                    let mut state = replicator.inner.state.lock().await;
                    state.phase = ReplicatorPhase::Error;
                }
                replicator.send_recovery(RecoveryRequest {
                    generation,
                    options: ResetOptions::resync(),
                    transient: false,
                });

                return;
            }
            Some(Ok(event)) => replicator.handle_change(event).await,
            Some(Err(err)) => {
                error!(error = %err, "change stream failed");
                replicator.inner.dispatcher.flush().await;
                replicator.request_recovery(generation, &err).await;

                return;
            }
            None => {
                info!("change stream closed");
                replicator.inner.dispatcher.flush().await;

                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mstream_error;

    #[test]
    fn lost_positions_force_a_resync() {
        let (options, transient) = recovery_for(&mstream_error!(
            ErrorKind::ResumePositionNotFound,
            "Resume token not found"
        ));
        assert_eq!(options, ResetOptions::resync());
        assert!(!transient);

        let (options, transient) = recovery_for(&mstream_error!(
            ErrorKind::SourceConnectionFailed,
            "Connection reset"
        ));
        assert_eq!(options, ResetOptions::reconnect());
        assert!(transient);
    }
}
