use std::sync::Arc;

use mstream_config::shared::ReplicationConfig;

use crate::concurrency::pause::PauseGate;
use crate::destination::Destination;
use crate::router::IndexRouter;

/// Dependencies shared by every replicator, created once at startup.
#[derive(Debug)]
pub struct ReplicationContext<Src, S, D> {
    pub config: Arc<ReplicationConfig>,
    pub source: Src,
    pub store: S,
    pub destination: D,
    pub router: Arc<IndexRouter<D>>,
    pub pause_gate: PauseGate,
}

impl<Src, S, D> ReplicationContext<Src, S, D>
where
    D: Destination + Clone + Send + Sync,
{
    /// Creates the context. `api_major_version` is the destination cluster's major version,
    /// which decides how collections map to index names.
    pub fn new(
        config: ReplicationConfig,
        api_major_version: u32,
        source: Src,
        store: S,
        destination: D,
    ) -> Self {
        let router = IndexRouter::new(
            config.mappings.clone(),
            api_major_version,
            destination.clone(),
        );

        Self {
            config: Arc::new(config),
            source,
            store,
            destination,
            router: Arc::new(router),
            pause_gate: PauseGate::new(),
        }
    }
}
