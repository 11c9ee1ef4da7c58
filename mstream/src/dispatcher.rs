//! Buffering of bulk units into size and time bounded bulk requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use mstream_config::shared::BatchConfig;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::destination::{BulkUnit, Destination};

/// Counters of a dispatcher since its creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub requests: u64,
    pub failed_requests: u64,
    pub succeeded_items: u64,
    pub failed_items: u64,
    pub routing_missing_items: u64,
    /// Units lost because the whole request carrying them failed.
    pub dropped_units: u64,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    requests: AtomicU64,
    failed_requests: AtomicU64,
    succeeded_items: AtomicU64,
    failed_items: AtomicU64,
    routing_missing_items: AtomicU64,
    dropped_units: AtomicU64,
}

impl DispatchCounters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            requests: self.requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            succeeded_items: self.succeeded_items.load(Ordering::Relaxed),
            failed_items: self.failed_items.load(Ordering::Relaxed),
            routing_missing_items: self.routing_missing_items.load(Ordering::Relaxed),
            dropped_units: self.dropped_units.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct DispatchState {
    buffer: Vec<BulkUnit>,
    buffered_lines: usize,
    in_flight: Option<JoinHandle<()>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl DispatchState {
    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug)]
struct DispatcherInner<D> {
    collection: String,
    destination: D,
    config: BatchConfig,
    state: Mutex<DispatchState>,
    counters: DispatchCounters,
}

impl<D> DispatcherInner<D>
where
    D: Destination,
{
    async fn send_bulk(&self, units: Vec<BulkUnit>) {
        let count = units.len();

        let response = match self.destination.bulk(units).await {
            Ok(response) => response,
            Err(err) => {
                self.counters.failed_requests.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .dropped_units
                    .fetch_add(count as u64, Ordering::Relaxed);
                error!(
                    collection = %self.collection,
                    units = count,
                    error = %err,
                    "bulk request failed, the batch is dropped"
                );

                return;
            }
        };

        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut failed = 0;
        for (item, item_error) in response.failed_items() {
            failed += 1;

            if item_error.is_routing_missing() {
                self.counters
                    .routing_missing_items
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    collection = %self.collection,
                    index = %item.index,
                    id = %item.id,
                    reason = %item_error.reason,
                    "bulk item rejected for missing routing, the collection mapping probably lacks \
                     its parent_field and parent_type"
                );
            } else {
                error!(
                    collection = %self.collection,
                    operation = %item.operation,
                    index = %item.index,
                    id = %item.id,
                    status = item.status,
                    error_type = %item_error.error_type,
                    reason = %item_error.reason,
                    "bulk item failed"
                );
            }
        }

        self.counters
            .failed_items
            .fetch_add(failed, Ordering::Relaxed);
        self.counters
            .succeeded_items
            .fetch_add(response.items.len() as u64 - failed, Ordering::Relaxed);
        debug!(collection = %self.collection, units = count, failed, "bulk request completed");
    }
}

/// Per-collection bulk buffer.
///
/// A request is sent when the buffered lines reach `2 × bulk_size` or when the idle timer armed
/// by the first buffered unit fires. At most one request is in flight: sending the next one first
/// waits for the previous one, which keeps destination writes in the order units were added and
/// holds back callers while the destination is slow.
#[derive(Debug)]
pub struct BatchDispatcher<D> {
    inner: Arc<DispatcherInner<D>>,
}

impl<D> Clone for BatchDispatcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D> BatchDispatcher<D>
where
    D: Destination + Send + Sync + 'static,
{
    pub fn new(collection: impl Into<String>, destination: D, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                collection: collection.into(),
                destination,
                config,
                state: Mutex::new(DispatchState::default()),
                counters: DispatchCounters::default(),
            }),
        }
    }

    /// Buffers `unit`, sending the buffer once it is full.
    pub async fn add(&self, unit: BulkUnit) {
        let mut state = self.inner.state.lock().await;
        state.buffered_lines += unit.line_count();
        state.buffer.push(unit);

        if state.buffered_lines >= self.inner.config.max_buffered_lines() {
            state.cancel_idle_timer();
            self.flush_locked(&mut state).await;
        } else if state.idle_timer.is_none() {
            state.idle_timer = Some(self.arm_idle_timer());
        }
    }

    /// Sends `units`, together with anything still buffered, as one request.
    pub async fn dispatch(&self, units: Vec<BulkUnit>) {
        let mut state = self.inner.state.lock().await;
        state.buffered_lines += units.iter().map(BulkUnit::line_count).sum::<usize>();
        state.buffer.extend(units);
        state.cancel_idle_timer();

        self.flush_locked(&mut state).await;
    }

    /// Sends whatever is buffered without waiting for the idle timer.
    pub async fn flush(&self) {
        let mut state = self.inner.state.lock().await;
        state.cancel_idle_timer();

        self.flush_locked(&mut state).await;
    }

    /// Waits for the request in flight, if any, to complete.
    pub async fn wait_for_in_flight(&self) {
        let mut state = self.inner.state.lock().await;
        self.await_in_flight(&mut state).await;
    }

    /// Sends the buffer and waits until every request completed.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.cancel_idle_timer();

        self.flush_locked(&mut state).await;
        self.await_in_flight(&mut state).await;
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.counters.snapshot()
    }

    /// Number of units waiting in the buffer.
    pub async fn buffered_units(&self) -> usize {
        self.inner.state.lock().await.buffer.len()
    }

    fn arm_idle_timer(&self) -> JoinHandle<()> {
        let delay = Duration::from_millis(self.inner.config.idle_flush_ms);
        let dispatcher = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = Weak::upgrade(&dispatcher) else {
                return;
            };
            let dispatcher = BatchDispatcher { inner };
            let mut state = dispatcher.inner.state.lock().await;
            // The handle belongs to this task, it must not be aborted while flushing.
            state.idle_timer = None;
            dispatcher.flush_locked(&mut state).await;
        })
    }

    async fn await_in_flight(&self, state: &mut MutexGuard<'_, DispatchState>) {
        if let Some(previous) = state.in_flight.take()
            && let Err(err) = previous.await
        {
            error!(
                collection = %self.inner.collection,
                error = %err,
                "bulk request task failed"
            );
        }
    }

    async fn flush_locked(&self, state: &mut MutexGuard<'_, DispatchState>) {
        self.await_in_flight(state).await;

        if state.buffer.is_empty() {
            return;
        }

        let units = std::mem::take(&mut state.buffer);
        state.buffered_lines = 0;

        let span = info_span!(
            "bulk_request",
            collection = %self.inner.collection,
            units = units.len()
        );
        let inner = self.inner.clone();
        state.in_flight = Some(tokio::spawn(
            async move { inner.send_bulk(units).await }.instrument(span),
        ));
    }
}
