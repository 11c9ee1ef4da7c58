//! Shared helpers for replication tests running against the in-memory source, store and
//! destination.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use mstream::context::ReplicationContext;
use mstream::destination::memory::MemoryDestination;
use mstream::source::memory::MemorySource;
use mstream::store::both::MemoryStore;
use mstream::supervisor::ReplicationSupervisor;
use mstream::types::{Document, DocumentKey};
use mstream_config::shared::{BatchConfig, ReplicationConfig, RetryConfig};
use serde_json::{Value, json};

/// Cluster version used by the tests. From version 6 on every collection gets its own index.
pub const API_MAJOR_VERSION: u32 = 7;

pub const ORDERS: &str = "orders";

/// Index receiving the `orders` collection.
pub const ORDERS_INDEX: &str = "shop-orders";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub type TestSupervisor = ReplicationSupervisor<MemorySource, MemoryStore, MemoryDestination>;

pub fn document(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// Documents `{"n": i}` keyed by `i`, for `i` in `ids`.
pub fn numbered_documents(
    ids: impl IntoIterator<Item = i64>,
) -> Vec<(DocumentKey, Document)> {
    ids.into_iter()
        .map(|id| (DocumentKey::Int(id), document(json!({ "n": id }))))
        .collect()
}

pub fn replication_config(collections: &[&str], bulk_size: usize) -> ReplicationConfig {
    let mappings = serde_json::from_value(json!({
        "default": {"index": "shop", "type": "$self"},
    }))
    .unwrap();

    ReplicationConfig {
        collections: collections.iter().map(|name| (*name).to_owned()).collect(),
        batch: BatchConfig {
            bulk_size,
            idle_flush_ms: 20,
        },
        resume_marker_interval_ms: 60_000,
        ignore_resume_markers_on_start: false,
        dump_on_start: false,
        mappings,
        feed_retry: RetryConfig {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_factor: 2.0,
        },
        ..ReplicationConfig::default()
    }
}

/// In-memory source, store and destination shared by the supervisors of a test.
#[derive(Debug, Clone, Default)]
pub struct TestEnvironment {
    pub source: MemorySource,
    pub store: MemoryStore,
    pub destination: MemoryDestination,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supervisor(&self, config: ReplicationConfig) -> TestSupervisor {
        ReplicationSupervisor::new(ReplicationContext::new(
            config,
            API_MAJOR_VERSION,
            self.source.clone(),
            self.store.clone(),
            self.destination.clone(),
        ))
    }
}

/// Polls `condition` until it holds, failing the test after a while.
pub async fn wait_until<F, Fut>(description: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let waiting = async {
        while !condition().await {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    if tokio::time::timeout(WAIT_TIMEOUT, waiting).await.is_err() {
        panic!("timed out waiting until {description}");
    }
}

/// Waits for a notification, failing the test after a while.
pub async fn notified(notify: &tokio::sync::Notify, description: &str) {
    if tokio::time::timeout(WAIT_TIMEOUT, notify.notified())
        .await
        .is_err()
    {
        panic!("timed out waiting for {description}");
    }
}
