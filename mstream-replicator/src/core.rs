use mstream::concurrency::signal::SignalRx;
use mstream::context::ReplicationContext;
use mstream::destination::elasticsearch::ElasticsearchDestination;
use mstream::source::mongodb::MongoSource;
use mstream::store::both::{FileStore, MongoStore};
use mstream::store::progress::DumpProgressStore;
use mstream::store::resume::ResumePositionStore;
use mstream::supervisor::ReplicationSupervisor;
use mstream_config::shared::{
    BatchConfig, ElasticsearchConfig, ReplicationConfig, ReplicatorConfig, StoreConfig,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

/// Starts the replicator service with the provided configuration.
///
/// Connects to MongoDB and Elasticsearch, picks the state store backend and runs the supervisor
/// until SIGINT or SIGTERM is received.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> anyhow::Result<()> {
    info!("starting replicator service");

    log_config(&replicator_config);

    let api_major_version = replicator_config.destination.api_major_version()?;
    let replication_config = replicator_config.effective_replication();

    let (source, reconnect_rx) = MongoSource::connect(&replicator_config.source).await?;

    let destination = ElasticsearchDestination::new(&replicator_config.destination)?;
    destination.ping().await?;

    // Static dispatch over the store backend, one arm per backend.
    match &replication_config.store {
        StoreConfig::File {
            resume_markers_dir,
            dump_progress_dir,
        } => {
            let store = FileStore::new(resume_markers_dir.clone(), dump_progress_dir.clone());
            let context = ReplicationContext::new(
                replication_config.clone(),
                api_major_version,
                source,
                store,
                destination,
            );

            start_supervisor(ReplicationSupervisor::new(context), reconnect_rx).await?;
        }
        StoreConfig::Collection {
            resume_markers_collection,
            dump_progress_collection,
        } => {
            let store = MongoStore::new(
                source.database(),
                resume_markers_collection,
                dump_progress_collection,
            );
            let context = ReplicationContext::new(
                replication_config.clone(),
                api_major_version,
                source,
                store,
                destination,
            );

            start_supervisor(ReplicationSupervisor::new(context), reconnect_rx).await?;
        }
    }

    info!("replicator service completed");

    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    debug!(database = config.source.database, "source mongodb config");
    log_destination_config(&config.destination);
    log_replication_config(&config.replication);
}

fn log_destination_config(config: &ElasticsearchConfig) {
    debug!(
        url = config.url,
        username = ?config.username,
        api_version = config.api_version,
        request_timeout_ms = config.request_timeout_ms,
        scroll_keep_alive = config.scroll_keep_alive,
        "destination elasticsearch config"
    );
}

fn log_replication_config(config: &ReplicationConfig) {
    debug!(
        collections = ?config.collections,
        resume_marker_interval_ms = config.resume_marker_interval_ms,
        ignore_resume_markers_on_start = config.ignore_resume_markers_on_start,
        dump_on_start = config.dump_on_start,
        store = ?config.store,
        mapped_collections = config.mappings.len(),
        "replication config"
    );
    log_batch_config(&config.batch);
}

fn log_batch_config(config: &BatchConfig) {
    debug!(
        bulk_size = config.bulk_size,
        idle_flush_ms = config.idle_flush_ms,
        "batch config"
    );
}

/// Starts the supervisor and handles graceful shutdown signals.
///
/// On SIGTERM or SIGINT every change stream is closed and the resume markers are persisted
/// before returning.
async fn start_supervisor<S>(
    supervisor: ReplicationSupervisor<MongoSource, S, ElasticsearchDestination>,
    reconnect_rx: SignalRx,
) -> anyhow::Result<()>
where
    S: ResumePositionStore + DumpProgressStore + Send + Sync + 'static,
{
    let collections = supervisor.start().await?;
    info!(?collections, "replicating collections");

    supervisor.spawn_reconnect_listener(reconnect_rx).await;

    let shutdown_tx = supervisor.shutdown_tx();
    let mut sigterm = signal(SignalKind::terminate())?;
    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, shutting down replication");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down replication");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {:?}", err);
        }
    });

    supervisor.wait().await;

    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    Ok(())
}
