//! Ownership of every collection replicator and the process-wide replication tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use crate::concurrency::signal::SignalRx;
use crate::context::ReplicationContext;
use crate::destination::Destination;
use crate::error::{MstreamError, MstreamResult};
use crate::replication::{CollectionReplicator, DumpOutcome, ReplicatorStatus, ResetOptions};
use crate::router::ResolvedMapping;
use crate::source::Source;
use crate::store::progress::DumpProgressStore;
use crate::store::resume::ResumePositionStore;

/// How [`ReplicationSupervisor::add_collections`] brings a collection up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOptions {
    /// Dump the collection before tailing it.
    pub dump: bool,
    /// Open the change stream at its current end instead of the stored marker.
    pub ignore_resume_markers: bool,
    /// Purge the destination copy and dump from scratch.
    pub ignore_dump_progress: bool,
    /// Tail the change stream.
    pub watch: bool,
}

/// Interpretation of a list of collection names given to an administrative operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectionFilter {
    /// Operate on the listed collections.
    #[default]
    Inclusive,
    /// Operate on every managed collection except the listed ones.
    Exclusive,
}

type Replicators<Src, S, D> = BTreeMap<String, CollectionReplicator<Src, S, D>>;

#[derive(Debug)]
struct SupervisorInner<Src, S, D> {
    ctx: Arc<ReplicationContext<Src, S, D>>,
    replicators: Mutex<Replicators<Src, S, D>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: ShutdownTx,
    /// Never polled; clones observe a shutdown that happened before they were made.
    shutdown_rx: ShutdownRx,
}

/// Owns the set of collection replicators.
///
/// Besides the administrative operations, the supervisor runs the periodic resume marker flush
/// and reacts to source reconnections by reopening every change stream at its last position.
#[derive(Debug)]
pub struct ReplicationSupervisor<Src, S, D> {
    inner: Arc<SupervisorInner<Src, S, D>>,
}

impl<Src, S, D> Clone for ReplicationSupervisor<Src, S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Src, S, D> ReplicationSupervisor<Src, S, D>
where
    Src: Source + Send + Sync + 'static,
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pub fn new(ctx: ReplicationContext<Src, S, D>) -> Self {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        Self {
            inner: Arc::new(SupervisorInner {
                ctx: Arc::new(ctx),
                replicators: Mutex::new(BTreeMap::new()),
                tasks: Mutex::new(Vec::new()),
                shutdown_tx,
                shutdown_rx,
            }),
        }
    }

    pub fn context(&self) -> &Arc<ReplicationContext<Src, S, D>> {
        &self.inner.ctx
    }

    /// Returns a handle that stops the supervisor's background tasks.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.inner.shutdown_tx.clone()
    }

    /// Starts the periodic marker flush and brings up every configured collection.
    pub async fn start(&self) -> MstreamResult<Vec<String>> {
        let config = self.inner.ctx.config.clone();
        info!(
            collections = ?config.collections,
            dump_on_start = config.dump_on_start,
            ignore_resume_markers_on_start = config.ignore_resume_markers_on_start,
            "starting replication"
        );

        self.spawn_marker_flush(Duration::from_millis(config.resume_marker_interval_ms))
            .await;

        let options = AddOptions {
            dump: config.dump_on_start,
            ignore_resume_markers: config.ignore_resume_markers_on_start,
            ignore_dump_progress: false,
            watch: true,
        };

        self.add_collections(&config.collections, options).await
    }

    /// Replaces the replicators of `collections` with new ones set up according to `options`.
    ///
    /// Returns every managed collection. Dump failures are logged and do not prevent tailing.
    pub async fn add_collections<T>(
        &self,
        collections: &[T],
        options: AddOptions,
    ) -> MstreamResult<Vec<String>>
    where
        T: AsRef<str>,
    {
        self.remove_collections(collections).await;

        let mut errors = Vec::new();
        for collection in collections {
            let collection = collection.as_ref();
            info!(collection, ?options, "adding collection");

            let replicator = CollectionReplicator::new(collection, self.inner.ctx.clone());
            self.inner
                .replicators
                .lock()
                .await
                .insert(collection.to_owned(), replicator.clone());

            if options.dump
                && let Err(err) = replicator.start_dump(options.ignore_dump_progress).await
            {
                error!(collection, error = %err, "failed to dump the collection");
            }

            if options.watch
                && let Err(err) = replicator.watch(options.ignore_resume_markers).await
            {
                error!(collection, error = %err, "failed to watch the collection");
                errors.push(err);
            }
        }

        if !errors.is_empty() {
            return Err(MstreamError::many(errors));
        }

        Ok(self.collections().await)
    }

    /// Removes the replicators of `collections`, persisting their resume markers. Returns the
    /// collections still managed.
    pub async fn remove_collections<T>(&self, collections: &[T]) -> Vec<String>
    where
        T: AsRef<str>,
    {
        let removed: Vec<_> = {
            let mut replicators = self.inner.replicators.lock().await;
            collections
                .iter()
                .filter_map(|collection| replicators.remove(collection.as_ref()))
                .collect()
        };

        for replicator in removed {
            replicator.remove().await;
        }

        self.collections().await
    }

    /// Dumps managed `collections` again. With `force`, the destination copy is purged and the
    /// dump starts from scratch.
    pub async fn dump_collections<T>(
        &self,
        collections: &[T],
        force: bool,
    ) -> MstreamResult<Vec<(String, DumpOutcome)>>
    where
        T: AsRef<str>,
    {
        let mut outcomes = Vec::new();
        let mut errors = Vec::new();

        for collection in collections {
            let collection = collection.as_ref();
            let Some(replicator) = self.replicator(collection).await else {
                warn!(collection, "cannot dump an unmanaged collection");
                continue;
            };

            match replicator.start_dump(force).await {
                Ok(outcome) => outcomes.push((collection.to_owned(), outcome)),
                Err(err) => {
                    error!(collection, error = %err, "failed to dump the collection");
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(MstreamError::many(errors));
        }

        Ok(outcomes)
    }

    /// Resolves administrative collection arguments against the managed collections.
    pub async fn filter_collections<T>(
        &self,
        collections: &[T],
        filter: CollectionFilter,
    ) -> Vec<String>
    where
        T: AsRef<str>,
    {
        match filter {
            CollectionFilter::Inclusive => collections
                .iter()
                .map(|collection| collection.as_ref().to_owned())
                .collect(),
            CollectionFilter::Exclusive => self
                .collections()
                .await
                .into_iter()
                .filter(|managed| {
                    !collections
                        .iter()
                        .any(|collection| collection.as_ref() == managed)
                })
                .collect(),
        }
    }

    /// Arms the pause gate. Returns `false` when dumps were already paused.
    pub fn pause_dumps(&self) -> bool {
        let paused = self.inner.ctx.pause_gate.pause();
        info!(paused, "dump pause requested");

        paused
    }

    /// Releases every paused dump. Returns `false` when no pause was outstanding.
    pub fn resume_dumps(&self) -> bool {
        let resumed = self.inner.ctx.pause_gate.resume();
        info!(resumed, "dump resume requested");

        resumed
    }

    pub async fn collections(&self) -> Vec<String> {
        self.inner.replicators.lock().await.keys().cloned().collect()
    }

    pub async fn replicator(&self, collection: &str) -> Option<CollectionReplicator<Src, S, D>> {
        self.inner.replicators.lock().await.get(collection).cloned()
    }

    pub async fn status(&self) -> Vec<ReplicatorStatus> {
        let mut statuses = Vec::new();
        for replicator in self.replicators().await {
            statuses.push(replicator.status().await);
        }

        statuses
    }

    /// Resolved mappings of the managed collections.
    pub async fn mappings(&self) -> HashMap<String, Arc<ResolvedMapping>> {
        let mut mappings = HashMap::new();
        for collection in self.collections().await {
            match self.inner.ctx.router.resolve_mapping(&collection).await {
                Ok(mapping) => {
                    mappings.insert(collection, mapping);
                }
                Err(err) => warn!(%collection, error = %err, "collection has no usable mapping"),
            }
        }

        mappings
    }

    pub async fn write_all_resume_markers(&self) {
        let replicators = self.replicators().await;
        debug!(collections = replicators.len(), "writing resume markers");

        join_all(
            replicators
                .iter()
                .map(|replicator| replicator.write_resume_marker()),
        )
        .await;
    }

    /// Reopens every change stream at its last known position.
    pub async fn handle_reconnect(&self) {
        let replicators = self.replicators().await;
        info!(
            collections = replicators.len(),
            "source connection re-established, reopening change streams"
        );

        let results = join_all(
            replicators
                .iter()
                .map(|replicator| replicator.reset_feed(ResetOptions::reconnect())),
        )
        .await;

        for (replicator, result) in replicators.iter().zip(results) {
            if let Err(err) = result {
                error!(
                    collection = replicator.collection(),
                    error = %err,
                    "failed to reopen the change stream after reconnecting"
                );
            }
        }
    }

    /// Calls [`ReplicationSupervisor::handle_reconnect`] every time `reconnect_rx` fires.
    pub async fn spawn_reconnect_listener(&self, mut reconnect_rx: SignalRx) {
        let supervisor = self.clone();
        let mut shutdown_rx = self.inner.shutdown_rx.clone();

        let task = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => return,
                        changed = reconnect_rx.changed() => {
                            if changed.is_err() {
                                debug!("reconnect signal closed");
                                return;
                            }

                            supervisor.handle_reconnect().await;
                        }
                    }
                }
            }
            .instrument(info_span!("reconnect_listener")),
        );

        self.inner.tasks.lock().await.push(task);
    }

    /// Waits for shutdown, then tears every replicator down and persists its state.
    pub async fn wait(&self) {
        let mut shutdown_rx = self.inner.shutdown_rx.clone();
        let _ = shutdown_rx.changed().await;

        self.stop().await;
    }

    /// Stops the background tasks and removes every replicator.
    pub async fn stop(&self) {
        info!("stopping replication");
        let _ = self.inner.shutdown_tx.shutdown();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(err) = task.await {
                error!(error = %err, "supervisor task failed");
            }
        }

        let collections = self.collections().await;
        self.remove_collections(&collections).await;
        info!("replication stopped");
    }

    async fn replicators(&self) -> Vec<CollectionReplicator<Src, S, D>> {
        self.inner
            .replicators
            .lock()
            .await
            .values()
            .cloned()
            .collect()
    }

    async fn spawn_marker_flush(&self, interval: Duration) {
        let supervisor = self.clone();
        let mut shutdown_rx = self.inner.shutdown_rx.clone();

        let task = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick completes immediately.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        biased;

                        _ = shutdown_rx.changed() => return,
                        _ = ticker.tick() => supervisor.write_all_resume_markers().await,
                    }
                }
            }
            .instrument(info_span!("resume_marker_flush")),
        );

        self.inner.tasks.lock().await.push(task);
    }
}
