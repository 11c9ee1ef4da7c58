use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, mpsc};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::ReplicationContext;
use crate::destination::Destination;
use crate::dispatcher::BatchDispatcher;
use crate::error::MstreamResult;
use crate::replication::state::{
    DumpOutcome, RecoveryRequest, ReplicatorPhase, ReplicatorState, ReplicatorStatus,
    ResetOptions,
};
use crate::source::Source;
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;
use crate::types::{DumpProgress, ResumeMarker};

#[derive(Debug)]
pub(super) struct ReplicatorInner<Src, S, D> {
    pub(super) collection: String,
    pub(super) ctx: Arc<ReplicationContext<Src, S, D>>,
    pub(super) dispatcher: BatchDispatcher<D>,
    pub(super) state: Mutex<ReplicatorState>,
    /// Serializes dumps, stream (re)opening and resets of the collection.
    pub(super) operations: Mutex<()>,
    pub(super) recovery_tx: mpsc::UnboundedSender<RecoveryRequest>,
}

/// Replicates one collection: dumps it, tails its change stream and recovers from stream
/// failures.
///
/// Every recovery goes through [`CollectionReplicator::reset_feed`]. Failures observed by the
/// change stream listener are handed to a recovery task owned by the replicator, so resets of a
/// collection never run concurrently.
#[derive(Debug)]
pub struct CollectionReplicator<Src, S, D> {
    pub(super) inner: Arc<ReplicatorInner<Src, S, D>>,
}

impl<Src, S, D> Clone for CollectionReplicator<Src, S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Src, S, D> CollectionReplicator<Src, S, D>
where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(collection: impl Into<String>, ctx: Arc<ReplicationContext<Src, S, D>>) -> Self {
        let collection = collection.into();
        let dispatcher = BatchDispatcher::new(
            collection.clone(),
            ctx.destination.clone(),
            ctx.config.batch.clone(),
        );
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ReplicatorInner {
            collection,
            ctx,
            dispatcher,
            state: Mutex::new(ReplicatorState::new()),
            operations: Mutex::new(()),
            recovery_tx,
        });

        let span = info_span!("recovery", collection = %inner.collection);
        tokio::spawn(run_recovery(Arc::downgrade(&inner), recovery_rx).instrument(span));

        Self { inner }
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    /// Copies the documents past the stored progress into the destination.
    pub async fn dump(&self) -> MstreamResult<DumpOutcome> {
        let _operations = self.inner.operations.lock().await;
        self.dump_locked().await
    }

    /// Dumps the collection, starting over from an empty destination copy when
    /// `ignore_dump_progress` is set or no document was ever dumped.
    pub async fn start_dump(&self, ignore_dump_progress: bool) -> MstreamResult<DumpOutcome> {
        let _operations = self.inner.operations.lock().await;

        let progress = self.load_progress().await;
        if ignore_dump_progress || progress.count == 0 {
            self.purge_destination().await;
            self.reset_progress().await;
        }

        self.dump_locked().await
    }

    /// Opens the change stream after the stored resume marker, or at the current end of the
    /// stream when there is none or `ignore_resume_marker` is set.
    pub async fn watch(&self, ignore_resume_marker: bool) -> MstreamResult<()> {
        let _operations = self.inner.operations.lock().await;
        self.watch_locked(ignore_resume_marker).await
    }

    /// Tears the change stream down and reopens it, optionally after a full resync.
    pub async fn reset_feed(&self, options: ResetOptions) -> MstreamResult<()> {
        let _operations = self.inner.operations.lock().await;
        self.reset_feed_locked(options).await
    }

    /// Stops the change stream listener and persists the resume marker.
    pub async fn teardown(&self) {
        let _operations = self.inner.operations.lock().await;
        self.teardown_listener().await;
    }

    /// Retires the replicator: stops its change stream for good, persists the resume marker and
    /// drains the dispatcher.
    ///
    /// A dump in progress is not cancelled and keeps writing until it ends.
    pub async fn remove(&self) {
        self.inner.state.lock().await.retired = true;
        self.teardown_listener().await;
        self.inner.dispatcher.close().await;
        info!(collection = %self.inner.collection, "replicator removed");
    }

    /// Persists the in-memory resume marker.
    pub async fn write_resume_marker(&self) {
        let (marker, loaded) = {
            let state = self.inner.state.lock().await;
            (state.marker.clone(), state.marker_loaded)
        };

        // Nothing newer than the store is known.
        if !loaded {
            return;
        }

        if let Err(err) = self
            .inner
            .ctx
            .store
            .write_resume_marker(&self.inner.collection, marker.as_ref())
            .await
        {
            error!(
                collection = %self.inner.collection,
                error = %err,
                "failed to persist the resume marker"
            );
        }
    }

    pub async fn status(&self) -> ReplicatorStatus {
        let state = self.inner.state.lock().await;

        ReplicatorStatus {
            collection: self.inner.collection.clone(),
            phase: state.phase,
            listening: state.is_listening(),
            has_resume_marker: state.marker.is_some(),
            dump_progress: state.progress.clone(),
            dispatch: self.inner.dispatcher.stats(),
        }
    }

    pub(super) async fn set_phase(&self, phase: ReplicatorPhase) {
        let mut state = self.inner.state.lock().await;
        if state.phase != phase {
            debug!(
                collection = %self.inner.collection,
                from = %state.phase,
                to = %phase,
                "replicator phase changed"
            );
            state.phase = phase;
        }
    }

    /// Returns the in-memory marker, reading the store the first time. Read failures count as
    /// no marker.
    pub(super) async fn resolve_marker(&self) -> Option<ResumeMarker> {
        let mut state = self.inner.state.lock().await;
        if state.marker_loaded {
            return state.marker.clone();
        }

        let marker = match self
            .inner
            .ctx
            .store
            .get_resume_marker(&self.inner.collection)
            .await
        {
            Ok(marker) => marker,
            Err(err) => {
                warn!(
                    collection = %self.inner.collection,
                    error = %err,
                    "failed to read the resume marker, starting from the current position"
                );
                None
            }
        };

        state.marker = marker.clone();
        state.marker_loaded = true;

        marker
    }

    pub(super) async fn reset_marker(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.marker = None;
            state.marker_loaded = true;
        }

        if let Err(err) = self
            .inner
            .ctx
            .store
            .reset_resume_marker(&self.inner.collection)
            .await
        {
            error!(
                collection = %self.inner.collection,
                error = %err,
                "failed to reset the resume marker"
            );
        }
    }

    /// Returns the in-memory dump progress, reading the store the first time. Read failures
    /// count as zero progress.
    pub(super) async fn load_progress(&self) -> DumpProgress {
        let mut state = self.inner.state.lock().await;
        if let Some(progress) = &state.progress {
            return progress.clone();
        }

        let progress = match self
            .inner
            .ctx
            .store
            .get_dump_progress(&self.inner.collection)
            .await
        {
            Ok(progress) => progress.unwrap_or_default(),
            Err(err) => {
                warn!(
                    collection = %self.inner.collection,
                    error = %err,
                    "failed to read the dump progress, starting from the beginning"
                );
                DumpProgress::default()
            }
        };

        state.progress = Some(progress.clone());

        progress
    }

    pub(super) async fn save_progress(&self, progress: &DumpProgress) {
        self.inner.state.lock().await.progress = Some(progress.clone());

        if let Err(err) = self
            .inner
            .ctx
            .store
            .write_dump_progress(&self.inner.collection, progress)
            .await
        {
            error!(
                collection = %self.inner.collection,
                error = %err,
                "failed to persist the dump progress"
            );
        }
    }

    pub(super) async fn reset_progress(&self) {
        let progress = match self
            .inner
            .ctx
            .store
            .reset_dump_progress(&self.inner.collection)
            .await
        {
            Ok(progress) => progress,
            Err(err) => {
                error!(
                    collection = %self.inner.collection,
                    error = %err,
                    "failed to reset the dump progress"
                );
                DumpProgress::default()
            }
        };

        self.inner.state.lock().await.progress = Some(progress);
    }

    pub(super) async fn reset_feed_locked(&self, options: ResetOptions) -> MstreamResult<()> {
        info!(
            collection = %self.inner.collection,
            dump = options.dump,
            ignore_resume_marker = options.ignore_resume_marker,
            "resetting change stream"
        );

        self.teardown_listener().await;

        if options.dump {
            self.reset_marker().await;
            self.purge_destination().await;
            self.reset_progress().await;

            if let Err(err) = self.dump_locked().await {
                error!(
                    collection = %self.inner.collection,
                    error = %err,
                    "failed to dump the collection"
                );
            }
        }

        if options.ignore_resume_marker {
            self.reset_marker().await;
        }

        self.watch_locked(false).await
    }

    /// Stops the listener, waits for it to exit and persists the resume marker.
    pub(super) async fn teardown_listener(&self) {
        let listener = {
            let mut state = self.inner.state.lock().await;
            if matches!(
                state.phase,
                ReplicatorPhase::Tailing | ReplicatorPhase::Error
            ) {
                state.phase = ReplicatorPhase::Idle;
            }

            state.listener.take()
        };

        if let Some(listener) = listener {
            let _ = listener.stop_tx.send(());
            if let Err(err) = listener.handle.await {
                error!(
                    collection = %self.inner.collection,
                    error = %err,
                    "change stream listener failed"
                );
            }
            debug!(collection = %self.inner.collection, "change stream listener stopped");
        }

        self.write_resume_marker().await;
    }

    /// Handles a recovery request from the listener, once any back-off delay elapsed.
    async fn recover(&self, request: RecoveryRequest) {
        if request.transient {
            let failures = self.inner.state.lock().await.consecutive_failures;
            let delay = self
                .inner
                .ctx
                .config
                .feed_retry
                .delay_for_attempt(failures.saturating_sub(1));

            if !delay.is_zero() {
                info!(
                    collection = %self.inner.collection,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before reconnecting the change stream"
                );
                tokio::time::sleep(delay).await;
            }
        }

        let _operations = self.inner.operations.lock().await;

        {
            let state = self.inner.state.lock().await;
            if state.retired || state.generation != request.generation {
                debug!(
                    collection = %self.inner.collection,
                    generation = request.generation,
                    "ignoring recovery request of a replaced change stream"
                );
                return;
            }
        }

        if let Err(err) = self.reset_feed_locked(request.options).await {
            error!(
                collection = %self.inner.collection,
                error = %err,
                "failed to reset the change stream"
            );
        }
    }
}

async fn run_recovery<Src, S, D>(
    replicator: Weak<ReplicatorInner<Src, S, D>>,
    mut recovery_rx: mpsc::UnboundedReceiver<RecoveryRequest>,
) where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    while let Some(request) = recovery_rx.recv().await {
        let Some(inner) = replicator.upgrade() else {
            return;
        };

        CollectionReplicator { inner }.recover(request).await;
    }
}
