use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bson::{Document as BsonDocument, doc};
use futures::{Stream, StreamExt, ready};
use mongodb::change_stream::ChangeStream;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::event::EventHandler;
use mongodb::event::sdam::SdamEvent;
use mongodb::options::{ChangeStreamOptions, ClientOptions, FullDocumentType};
use mongodb::{Client, Collection, Database};
use mstream_config::shared::MongoConfig;
use pin_project_lite::pin_project;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};
use crate::conversions::bson::{key_from_bson, key_to_bson, split_document};
use crate::error::{MstreamError, MstreamResult};
use crate::source::{ChangeFeed, DocumentCursor, Source};
use crate::types::{
    ChangeEvent, DocumentKey, MutationKind, MutationRecord, ResumeMarker, SourceDocument,
};

/// MongoDB deployment read through change streams and `_id` ordered cursors.
#[derive(Debug, Clone)]
pub struct MongoSource {
    database: Database,
}

impl MongoSource {
    /// Connects to the deployment and checks that the database answers.
    ///
    /// The returned [`SignalRx`] fires every time the connection to a server is re-established
    /// after heartbeats started failing. Open change streams must be re-created at that point.
    pub async fn connect(config: &MongoConfig) -> MstreamResult<(Self, SignalRx)> {
        let mut options = ClientOptions::parse(config.url.expose_secret()).await?;

        let (reconnect_tx, reconnect_rx) = create_signal();
        options.sdam_event_handler = Some(reconnect_monitor(reconnect_tx));

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        database.run_command(doc! { "ping": 1 }).await?;

        info!(database = %config.database, "connected to mongodb");

        Ok((Self { database }, reconnect_rx))
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    fn collection(&self, collection: &str) -> Collection<BsonDocument> {
        self.database.collection(collection)
    }
}

/// Raises a reconnect signal when a heartbeat succeeds after at least one failed heartbeat.
fn reconnect_monitor(reconnect_tx: SignalTx) -> EventHandler<SdamEvent> {
    let connection_lost = Arc::new(AtomicBool::new(false));

    EventHandler::callback(move |event: SdamEvent| match event {
        SdamEvent::ServerHeartbeatFailed(event) => {
            if !connection_lost.swap(true, Ordering::SeqCst) {
                warn!(server = %event.server_address, "lost connection to mongodb");
            }
        }
        SdamEvent::ServerHeartbeatSucceeded(event) => {
            if connection_lost.swap(false, Ordering::SeqCst) {
                info!(server = %event.server_address, "connection to mongodb re-established");
                let _ = reconnect_tx.send(());
            }
        }
        _ => {}
    })
}

fn filter_after(after: Option<&DocumentKey>) -> MstreamResult<BsonDocument> {
    match after {
        Some(key) => Ok(doc! { "_id": { "$gt": key_to_bson(key)? } }),
        None => Ok(doc! {}),
    }
}

impl Source for MongoSource {
    async fn open_change_feed(
        &self,
        collection: &str,
        resume_after: Option<ResumeMarker>,
    ) -> MstreamResult<ChangeFeed> {
        let resume_token = resume_after
            .map(|marker| bson::from_slice::<ResumeToken>(marker.as_bytes()))
            .transpose()?;

        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .resume_after(resume_token)
            .build();

        let stream = self
            .collection(collection)
            .watch()
            .with_options(options)
            .await?;

        Ok(MongoChangeFeed::wrap(stream, collection.to_owned()).boxed())
    }

    async fn count_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
    ) -> MstreamResult<u64> {
        let filter = filter_after(after)?;
        let count = self.collection(collection).count_documents(filter).await?;

        Ok(count)
    }

    async fn read_documents_after(
        &self,
        collection: &str,
        after: Option<&DocumentKey>,
        batch_size: u32,
    ) -> MstreamResult<DocumentCursor> {
        let filter = filter_after(after)?;
        let cursor = self
            .collection(collection)
            .find(filter)
            .sort(doc! { "_id": 1 })
            .batch_size(batch_size)
            .await?;

        Ok(cursor
            .map(|document| -> MstreamResult<SourceDocument> {
                let (key, document) = split_document(document.map_err(MstreamError::from)?)?;
                Ok(SourceDocument { key, document })
            })
            .boxed())
    }
}

pin_project! {
    /// Adapts a driver change stream to [`ChangeEvent`]s.
    ///
    /// Operation types without an index counterpart (drops, renames) are skipped; the stream
    /// follows them with an invalidate event anyway.
    #[must_use = "streams do nothing unless polled"]
    pub struct MongoChangeFeed {
        #[pin]
        inner: ChangeStream<ChangeStreamEvent<BsonDocument>>,
        collection: String,
    }
}

impl MongoChangeFeed {
    pub fn wrap(inner: ChangeStream<ChangeStreamEvent<BsonDocument>>, collection: String) -> Self {
        Self { inner, collection }
    }
}

impl Stream for MongoChangeFeed {
    type Item = MstreamResult<ChangeEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
                Some(Ok(event)) => match convert_event(this.collection, event) {
                    Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                    Ok(None) => continue,
                    Err(err) => return Poll::Ready(Some(Err(err))),
                },
            }
        }
    }
}

/// Converts a driver event. A change whose content cannot be read becomes a
/// [`MutationKind::Skipped`] record so the stream still moves past it; only an unusable resume
/// token is an error.
fn convert_event(
    collection: &str,
    event: ChangeStreamEvent<BsonDocument>,
) -> MstreamResult<Option<ChangeEvent>> {
    let kind = match event.operation_type {
        OperationType::Insert => MutationKind::Insert,
        OperationType::Update => MutationKind::Update,
        OperationType::Replace => MutationKind::Replace,
        OperationType::Delete => MutationKind::Delete,
        OperationType::Invalidate => MutationKind::Invalidate,
        other => {
            debug!(collection, operation = ?other, "skipping change without index counterpart");
            return Ok(None);
        }
    };

    let position = ResumeMarker::new(bson::to_vec(&event.id)?);

    let key = event
        .document_key
        .and_then(|mut document_key| document_key.remove("_id"))
        .map(key_from_bson);

    let document = match event.full_document.map(split_document).transpose() {
        Ok(document) => document.map(|(_, document)| document),
        Err(err) => {
            warn!(
                collection,
                %kind,
                key = ?key,
                error = %err,
                "failed to read the changed document, skipping the change"
            );

            return Ok(Some(ChangeEvent {
                position,
                record: MutationRecord::skipped(collection),
            }));
        }
    };

    Ok(Some(ChangeEvent {
        position,
        record: MutationRecord {
            kind,
            collection: collection.to_owned(),
            key,
            document,
        },
    }))
}

#[cfg(test)]
mod tests {
    use bson::Bson;
    use bson::spec::BinarySubtype;

    use super::*;

    /// Decodes `document` from raw bytes, the way the driver reads events off the wire.
    fn event(document: BsonDocument) -> ChangeStreamEvent<BsonDocument> {
        bson::from_slice(&bson::to_vec(&document).unwrap()).unwrap()
    }

    #[test]
    fn inserts_with_double_ids_convert() {
        let change = event(doc! {
            "_id": { "_data": "8265A1F0C2000000012B" },
            "operationType": "insert",
            "documentKey": { "_id": 1.5 },
            "fullDocument": { "_id": 1.5, "status": "new" },
        });

        let converted = convert_event("orders", change).unwrap().unwrap();

        assert!(!converted.position.as_bytes().is_empty());
        assert_eq!(converted.record.kind, MutationKind::Insert);
        assert_eq!(converted.record.key.as_ref().unwrap().to_string(), "1.5");
        assert_eq!(
            converted.record.document.unwrap()["status"],
            serde_json::Value::from("new")
        );
    }

    #[test]
    fn deletes_with_uuid_ids_convert() {
        let uuid = Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Uuid,
            bytes: vec![0x2a; 16],
        });
        let change = event(doc! {
            "_id": { "_data": "8265A1F0C2000000022B" },
            "operationType": "delete",
            "documentKey": { "_id": uuid.clone() },
        });

        let converted = convert_event("orders", change).unwrap().unwrap();

        assert_eq!(converted.record.kind, MutationKind::Delete);
        let key = converted.record.key.unwrap();
        assert_eq!(key_to_bson(&key).unwrap(), uuid);
    }

    #[test]
    fn unreadable_changes_are_skipped_at_their_position() {
        let change = event(doc! {
            "_id": { "_data": "8265A1F0C2000000032B" },
            "operationType": "replace",
            "documentKey": { "_id": 3_i32 },
            "fullDocument": { "status": "lost its id" },
        });

        let converted = convert_event("orders", change).unwrap().unwrap();

        assert!(!converted.position.as_bytes().is_empty());
        assert_eq!(converted.record, MutationRecord::skipped("orders"));
    }

    #[test]
    fn drops_are_not_forwarded() {
        let change = event(doc! {
            "_id": { "_data": "8265A1F0C2000000042B" },
            "operationType": "drop",
        });

        assert!(convert_event("orders", change).unwrap().is_none());
    }
}
