mod common;

use mstream::destination::BulkOperation;
use mstream::error::ErrorKind;
use mstream::mstream_error;
use mstream::replication::ReplicatorPhase;
use mstream::store::resume::ResumePositionStore;
use mstream::supervisor::AddOptions;
use mstream::types::{DocumentKey, ResumeMarker};
use mstream_telemetry::init_test_tracing;
use serde_json::json;

use crate::common::{
    ORDERS, ORDERS_INDEX, TestEnvironment, document, notified, numbered_documents,
    replication_config, wait_until,
};

fn watch_only() -> AddOptions {
    AddOptions {
        watch: true,
        ..AddOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tailing_applies_inserts_updates_and_deletes() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 2)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"status": "new"})))
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(2), document(json!({"status": "new"})))
        .await;
    notified(&inserted, "both inserts").await;

    env.source
        .update_document(ORDERS, DocumentKey::Int(1), document(json!({"status": "paid"})))
        .await;
    env.source.delete_document(ORDERS, DocumentKey::Int(2)).await;

    let destination = &env.destination;
    wait_until("the update and the delete are applied", move || async move {
        destination.documents(ORDERS_INDEX).await.into_iter().collect::<Vec<_>>()
            == vec![("1".to_owned(), document(json!({"status": "paid"})))]
    })
    .await;

    let status = supervisor.replicator(ORDERS).await.unwrap().status().await;
    assert_eq!(status.phase, ReplicatorPhase::Tailing);
    assert!(status.listening);
    assert!(status.has_resume_marker);
    assert_eq!(env.source.cursor_opens(ORDERS).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_carry_the_next_external_version() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let mut config = replication_config(&[ORDERS], 10);
    config.mappings.insert(
        ORDERS.to_owned(),
        serde_json::from_value(json!({"version_field": "v", "version_type": "external"}))
            .unwrap(),
    );
    let supervisor = env.supervisor(config);
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 1)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"v": 5})))
        .await;
    notified(&inserted, "the insert").await;
    assert_eq!(
        env.destination
            .document_meta(ORDERS_INDEX, "1")
            .await
            .unwrap()
            .version,
        Some(5)
    );

    let deleted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 0)
        .await;
    env.source.delete_document(ORDERS, DocumentKey::Int(1)).await;
    notified(&deleted, "the delete").await;

    let requests = env.destination.bulk_requests().await;
    let delete = requests
        .iter()
        .flatten()
        .find(|unit| unit.action.operation == BulkOperation::Delete)
        .unwrap();
    assert_eq!(delete.action.version, Some(6));
    assert_eq!(env.destination.lookups().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn documents_without_their_parent_are_skipped() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.destination.require_routing(ORDERS_INDEX).await;
    let mut config = replication_config(&[ORDERS], 10);
    config.mappings.insert(
        ORDERS.to_owned(),
        serde_json::from_value(json!({
            "parent_field": "customerId",
            "parent_type": "customers",
        }))
        .unwrap(),
    );
    let supervisor = env.supervisor(config);
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let indexed = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 1)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"total": 10})))
        .await;
    env.source
        .insert_document(
            ORDERS,
            DocumentKey::Int(2),
            document(json!({"customerId": 7, "total": 20})),
        )
        .await;
    notified(&indexed, "the document with a parent").await;

    let ids: Vec<_> = env
        .destination
        .documents(ORDERS_INDEX)
        .await
        .into_keys()
        .collect();
    assert_eq!(ids, vec!["2"]);
    assert_eq!(
        env.destination
            .document_meta(ORDERS_INDEX, "2")
            .await
            .unwrap()
            .parent
            .as_deref(),
        Some("7")
    );

    let stats = supervisor.replicator(ORDERS).await.unwrap().status().await.dispatch;
    assert_eq!(stats.routing_missing_items, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn replaying_changes_leaves_the_index_unchanged() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let config = replication_config(&[ORDERS], 10);

    let supervisor = env.supervisor(config.clone());
    supervisor.start().await.unwrap();

    let first = env
        .source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"status": "new"})))
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(2), document(json!({"status": "new"})))
        .await;
    let last = env
        .source
        .update_document(ORDERS, DocumentKey::Int(1), document(json!({"status": "paid"})))
        .await;

    let destination = &env.destination;
    wait_until("the update is applied", move || async move {
        destination.document(ORDERS_INDEX, "1").await == Some(document(json!({"status": "paid"})))
            && destination.document(ORDERS_INDEX, "2").await.is_some()
    })
    .await;
    supervisor.stop().await;

    assert_eq!(env.store.stored_resume_marker(ORDERS).await, Some(last));
    let expected = env.destination.documents(ORDERS_INDEX).await;
    let requests_before = env.destination.bulk_requests().await.len();

    // Rewind to the first change so that the next two are delivered again.
    env.store
        .write_resume_marker(ORDERS, Some(&first))
        .await
        .unwrap();
    let replayed = env
        .destination
        .notify_on_bulk_requests(requests_before + 1)
        .await;

    let supervisor = env.supervisor(config);
    supervisor.start().await.unwrap();
    notified(&replayed, "the replayed changes").await;

    assert_eq!(env.destination.documents(ORDERS_INDEX).await, expected);
    assert_eq!(
        env.source.opened_feeds(ORDERS).await.last(),
        Some(&Some(first))
    );
    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalidated_streams_resync_the_collection() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let supervisor = env.supervisor(replication_config(&[ORDERS], 2));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 1)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"n": 1})))
        .await;
    notified(&inserted, "the insert").await;

    // Left behind by an earlier run, gone from the source.
    env.destination
        .put_document(ORDERS_INDEX, "999", document(json!({"n": 999})), None, 1)
        .await;
    env.source.invalidate(ORDERS).await;

    let source = &env.source;
    let replicator = supervisor.replicator(ORDERS).await.unwrap();
    let watched = &replicator;
    wait_until("the change stream is reopened", move || async move {
        source.opened_feeds(ORDERS).await.len() == 2 && watched.status().await.listening
    })
    .await;

    assert_eq!(env.source.opened_feeds(ORDERS).await, vec![None, None]);
    let ids: Vec<_> = env
        .destination
        .documents(ORDERS_INDEX)
        .await
        .into_keys()
        .collect();
    assert_eq!(ids, vec!["1"]);
    assert_eq!(env.store.stored_resume_marker(ORDERS).await, None);
    assert!(
        env.store
            .stored_dump_progress(ORDERS)
            .await
            .unwrap()
            .is_complete()
    );
    assert_eq!(replicator.status().await.phase, ReplicatorPhase::Tailing);
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_resume_positions_trigger_a_full_dump() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.source
        .seed_documents(ORDERS, numbered_documents(1..=3))
        .await;
    let stale = ResumeMarker::new(1_000u64.to_be_bytes().to_vec());
    env.store
        .write_resume_marker(ORDERS, Some(&stale))
        .await
        .unwrap();

    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor.start().await.unwrap();

    let source = &env.source;
    let replicator = supervisor.replicator(ORDERS).await.unwrap();
    let watched = &replicator;
    wait_until("the change stream is reopened", move || async move {
        source.opened_feeds(ORDERS).await.len() == 2 && watched.status().await.listening
    })
    .await;

    assert_eq!(
        env.source.opened_feeds(ORDERS).await,
        vec![Some(stale), None]
    );
    assert_eq!(env.destination.documents(ORDERS_INDEX).await.len(), 3);
    assert_eq!(env.store.stored_resume_marker(ORDERS).await, None);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_failures_reconnect_at_the_last_position() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 1)
        .await;
    let marker = env
        .source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"n": 1})))
        .await;
    notified(&inserted, "the first insert").await;

    env.source
        .fail_feeds(
            ORDERS,
            mstream_error!(ErrorKind::SourceConnectionFailed, "Connection reset"),
        )
        .await;

    let source = &env.source;
    wait_until("the change stream is reopened", move || async move {
        source.opened_feeds(ORDERS).await.len() == 2 && source.active_feeds(ORDERS).await == 1
    })
    .await;
    assert_eq!(
        env.source.opened_feeds(ORDERS).await.last(),
        Some(&Some(marker))
    );

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 2)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(2), document(json!({"n": 2})))
        .await;
    notified(&inserted, "the insert after reconnecting").await;

    // No resync happened.
    assert_eq!(env.source.cursor_opens(ORDERS).await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_opens_are_retried() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.source
        .fail_next_open(
            ORDERS,
            mstream_error!(ErrorKind::SourceConnectionFailed, "Server selection timeout"),
        )
        .await;

    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let replicator = supervisor.replicator(ORDERS).await.unwrap();
    let watched = &replicator;
    wait_until("the change stream is open", move || async move {
        watched.status().await.listening
    })
    .await;

    assert_eq!(env.source.opened_feeds(ORDERS).await, vec![None, None]);
    assert_eq!(replicator.status().await.phase, ReplicatorPhase::Tailing);
}

#[tokio::test(flavor = "multi_thread")]
async fn ignoring_resume_markers_starts_from_now() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let stale = ResumeMarker::new(1_000u64.to_be_bytes().to_vec());
    env.store
        .write_resume_marker(ORDERS, Some(&stale))
        .await
        .unwrap();

    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(
            &[ORDERS],
            AddOptions {
                watch: true,
                ignore_resume_markers: true,
                ..AddOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(env.source.opened_feeds(ORDERS).await, vec![None]);
    assert_eq!(env.store.stored_resume_marker(ORDERS).await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_changes_are_skipped_without_reconnecting() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    let skipped = env.source.emit_unreadable_change(ORDERS).await;

    let store = &env.store;
    let flushing = &supervisor;
    let expected = &skipped;
    wait_until("the marker moves past the unreadable change", move || async move {
        flushing.write_all_resume_markers().await;
        store.stored_resume_marker(ORDERS).await.as_ref() == Some(expected)
    })
    .await;

    let inserted = env
        .destination
        .notify_on_document_count(ORDERS_INDEX, 1)
        .await;
    env.source
        .insert_document(ORDERS, DocumentKey::Int(1), document(json!({"n": 1})))
        .await;
    notified(&inserted, "the insert after the unreadable change").await;

    assert_eq!(env.source.opened_feeds(ORDERS).await, vec![None]);
    assert_eq!(env.destination.documents(ORDERS_INDEX).await.len(), 1);
    let status = supervisor.replicator(ORDERS).await.unwrap().status().await;
    assert_eq!(status.phase, ReplicatorPhase::Tailing);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_marker_reads_open_the_stream_at_its_end() {
    init_test_tracing();
    let env = TestEnvironment::new();
    let stored = ResumeMarker::new(3u64.to_be_bytes().to_vec());
    env.store
        .write_resume_marker(ORDERS, Some(&stored))
        .await
        .unwrap();
    env.store.fail_reads(true).await;

    let supervisor = env.supervisor(replication_config(&[ORDERS], 10));
    supervisor
        .add_collections(&[ORDERS], watch_only())
        .await
        .unwrap();

    assert_eq!(env.source.opened_feeds(ORDERS).await, vec![None]);
    assert!(supervisor.replicator(ORDERS).await.unwrap().status().await.listening);
    // Nothing was written over the stored marker.
    assert_eq!(env.store.stored_resume_marker(ORDERS).await, Some(stored));
}
