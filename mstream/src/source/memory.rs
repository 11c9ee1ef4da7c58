use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::channel::mpsc;
use futures::{StreamExt, stream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{ErrorKind, MstreamError, MstreamResult};
use crate::mstream_error;
use crate::source::{ChangeFeed, DocumentCursor, Source};
use crate::types::{
    ChangeEvent, Document, DocumentKey, MutationRecord, ResumeMarker, SourceDocument,
};

type FeedSender = mpsc::UnboundedSender<MstreamResult<ChangeEvent>>;

#[derive(Debug, Default)]
struct FeedLog {
    /// Events still resumable from, in sequence order.
    history: Vec<(u64, ChangeEvent)>,
    subscribers: Vec<FeedSender>,
    opened: Vec<Option<ResumeMarker>>,
    fail_next_open: Option<MstreamError>,
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<DocumentKey, Document>>,
    feeds: HashMap<String, FeedLog>,
    next_sequence: u64,
    documents_read: HashMap<String, Arc<AtomicU64>>,
    cursor_opens: HashMap<String, usize>,
    cursor_failures: HashMap<String, usize>,
}

impl Inner {
    fn emit(&mut self, record: MutationRecord) -> ResumeMarker {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let event = ChangeEvent {
            position: position_of(sequence),
            record,
        };
        let position = event.position.clone();

        let feed = self.feeds.entry(event.record.collection.clone()).or_default();
        feed.subscribers
            .retain(|subscriber| subscriber.unbounded_send(Ok(event.clone())).is_ok());
        feed.history.push((sequence, event));

        position
    }

    fn collection_mut(&mut self, collection: &str) -> &mut BTreeMap<DocumentKey, Document> {
        self.collections.entry(collection.to_owned()).or_default()
    }
}

fn position_of(sequence: u64) -> ResumeMarker {
    ResumeMarker::new(sequence.to_be_bytes().to_vec())
}

fn sequence_of(marker: &ResumeMarker) -> Option<u64> {
    let bytes: [u8; 8] = marker.as_bytes().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// In-memory document database with per-collection change streams.
///
/// Mutations through [`MemorySource::insert_document`], [`MemorySource::update_document`] and
/// [`MemorySource::delete_document`] change the stored documents and emit the matching change
/// event, like a real deployment would. Failures can be injected into open streams and cursors.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Stores documents without emitting change events, as if they predate every stream.
    pub async fn seed_documents<I>(&self, collection: &str, documents: I)
    where
        I: IntoIterator<Item = (DocumentKey, Document)>,
    {
        let mut inner = self.inner.lock().await;
        inner.collection_mut(collection).extend(documents);
    }

    pub async fn insert_document(
        &self,
        collection: &str,
        key: DocumentKey,
        document: Document,
    ) -> ResumeMarker {
        let mut inner = self.inner.lock().await;
        inner
            .collection_mut(collection)
            .insert(key.clone(), document.clone());

        inner.emit(MutationRecord::insert(collection, key, document))
    }

    pub async fn update_document(
        &self,
        collection: &str,
        key: DocumentKey,
        document: Document,
    ) -> ResumeMarker {
        let mut inner = self.inner.lock().await;
        inner
            .collection_mut(collection)
            .insert(key.clone(), document.clone());

        inner.emit(MutationRecord::update(collection, key, document))
    }

    pub async fn delete_document(&self, collection: &str, key: DocumentKey) -> ResumeMarker {
        let mut inner = self.inner.lock().await;
        inner.collection_mut(collection).remove(&key);

        inner.emit(MutationRecord::delete(collection, key))
    }

    /// Emits a change whose content could not be read.
    pub async fn emit_unreadable_change(&self, collection: &str) -> ResumeMarker {
        let mut inner = self.inner.lock().await;
        inner.emit(MutationRecord::skipped(collection))
    }

    /// Emits an invalidate event and closes every open stream of `collection`.
    pub async fn invalidate(&self, collection: &str) -> ResumeMarker {
        let mut inner = self.inner.lock().await;
        let position = inner.emit(MutationRecord::invalidate(collection));
        if let Some(feed) = inner.feeds.get_mut(collection) {
            feed.subscribers.clear();
        }

        position
    }

    /// Terminates every open stream of `collection` with `error`.
    pub async fn fail_feeds(&self, collection: &str, error: MstreamError) {
        let mut inner = self.inner.lock().await;
        if let Some(feed) = inner.feeds.get_mut(collection) {
            for subscriber in feed.subscribers.drain(..) {
                let _ = subscriber.unbounded_send(Err(error.clone()));
            }
        }
    }

    /// Ends every open stream of `collection` without an error.
    pub async fn close_feeds(&self, collection: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(feed) = inner.feeds.get_mut(collection) {
            feed.subscribers.clear();
        }
    }

    /// Forgets the change history of `collection`; resuming from an older marker then fails
    /// with [`ErrorKind::ResumePositionNotFound`].
    pub async fn truncate_history(&self, collection: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(feed) = inner.feeds.get_mut(collection) {
            feed.history.clear();
        }
    }

    /// Makes the next [`Source::open_change_feed`] call for `collection` fail with `error`.
    pub async fn fail_next_open(&self, collection: &str, error: MstreamError) {
        let mut inner = self.inner.lock().await;
        inner
            .feeds
            .entry(collection.to_owned())
            .or_default()
            .fail_next_open = Some(error);
    }

    /// Makes the next cursor over `collection` fail after yielding `after` documents.
    pub async fn fail_next_cursor(&self, collection: &str, after: usize) {
        let mut inner = self.inner.lock().await;
        inner.cursor_failures.insert(collection.to_owned(), after);
    }

    /// Resume markers passed to every [`Source::open_change_feed`] call for `collection`.
    pub async fn opened_feeds(&self, collection: &str) -> Vec<Option<ResumeMarker>> {
        let inner = self.inner.lock().await;
        inner
            .feeds
            .get(collection)
            .map(|feed| feed.opened.clone())
            .unwrap_or_default()
    }

    /// Number of streams of `collection` that are still open on the consumer side.
    pub async fn active_feeds(&self, collection: &str) -> usize {
        let mut inner = self.inner.lock().await;
        match inner.feeds.get_mut(collection) {
            Some(feed) => {
                feed.subscribers.retain(|subscriber| !subscriber.is_closed());
                feed.subscribers.len()
            }
            None => 0,
        }
    }

    pub async fn documents_read(&self, collection: &str) -> u64 {
        let inner = self.inner.lock().await;
        inner
            .documents_read
            .get(collection)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub async fn cursor_opens(&self, collection: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.cursor_opens.get(collection).copied().unwrap_or(0)
    }

    pub async fn documents(&self, collection: &str) -> BTreeMap<DocumentKey, Document> {
        let inner = self.inner.lock().await;
        inner.collections.get(collection).cloned().unwrap_or_default()
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for MemorySource {
    async fn open_change_feed(
        &self,
        collection: &str,
        resume_after: Option<ResumeMarker>,
    ) -> MstreamResult<ChangeFeed> {
        let mut inner = self.inner.lock().await;
        let feed = inner.feeds.entry(collection.to_owned()).or_default();
        feed.opened.push(resume_after.clone());

        if let Some(error) = feed.fail_next_open.take() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded();

        if let Some(marker) = resume_after {
            let sequence = sequence_of(&marker).filter(|sequence| {
                feed.history
                    .iter()
                    .any(|(retained, _)| retained == sequence)
            });
            let Some(sequence) = sequence else {
                return Err(mstream_error!(
                    ErrorKind::ResumePositionNotFound,
                    "Resume token not found in change history",
                    collection
                ));
            };

            for (_, event) in feed
                .history
                .iter()
                .filter(|(retained, _)| *retained > sequence)
            {
                let _ = tx.unbounded_send(Ok(event.clone()));
            }
        }

        debug!(collection, "opened in-memory change feed");
        feed.subscribers.push(tx);

        Ok(rx.boxed())
    }

    async fn count_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
    ) -> MstreamResult<u64> {
        let inner = self.inner.lock().await;
        let count = inner
            .collections
            .get(collection)
            .map(|documents| match after {
                Some(after) => documents.keys().filter(|key| *key > after).count(),
                None => documents.len(),
            })
            .unwrap_or(0);

        Ok(count as u64)
    }

    async fn read_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        _batch_size: u32,
    ) -> MstreamResult<DocumentCursor> {
        let mut inner = self.inner.lock().await;
        *inner.cursor_opens.entry(collection.to_owned()).or_default() += 1;

        let snapshot: Vec<MstreamResult<SourceDocument>> = inner
            .collections
            .get(collection)
            .map(|documents| {
                documents
                    .iter()
                    .filter(|(key, _)| after.is_none_or(|after| *key > after))
                    .map(|(key, document)| {
                        Ok(SourceDocument {
                            key: key.clone(),
                            document: document.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let snapshot = match inner.cursor_failures.remove(collection) {
            Some(fail_after) => {
                let mut truncated: Vec<_> = snapshot.into_iter().take(fail_after).collect();
                truncated.push(Err(mstream_error!(
                    ErrorKind::SourceQueryFailed,
                    "Cursor was killed",
                    collection
                )));
                truncated
            }
            None => snapshot,
        };

        let counter = inner
            .documents_read
            .entry(collection.to_owned())
            .or_default()
            .clone();

        Ok(stream::iter(snapshot)
            .inspect(move |document| {
                if document.is_ok() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .boxed())
    }
}
