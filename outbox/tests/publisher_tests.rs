//! Outbox drain-loop scenarios: cursor discipline under success, partial
//! failure and corrupt data.

#![allow(clippy::expect_used, clippy::panic)] // Test code fails loudly

use eventline_core::tracker::PublishedNotificationTrackerStore;
use eventline_core::{DomainEvent, EventStore, NotificationProducer};
use eventline_outbox::{NotificationPublisher, PublishError};
use eventline_testing::mocks::{
    FlakyProducer, InMemoryEventStore, InMemoryPublishedNotificationTrackerStore,
    RecordingProducer,
};
use serde_json::json;
use std::sync::Arc;

struct Harness {
    store: Arc<InMemoryEventStore>,
    tracker_store: Arc<InMemoryPublishedNotificationTrackerStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryEventStore::new()),
            tracker_store: Arc::new(InMemoryPublishedNotificationTrackerStore::new("order-events")),
        }
    }

    fn publisher(&self, producer: Arc<dyn NotificationProducer>) -> NotificationPublisher {
        NotificationPublisher::new(
            Arc::clone(&self.store) as Arc<dyn EventStore>,
            Arc::clone(&self.tracker_store) as Arc<dyn PublishedNotificationTrackerStore>,
            producer,
        )
    }

    async fn append(&self, count: i64) {
        for index in 0..count {
            let event = DomainEvent::new("order.placed", 1, json!({ "index": index }))
                .expect("valid event");
            self.store.append(event).await.expect("appends");
        }
    }
}

#[tokio::test]
async fn publishes_everything_and_advances_the_cursor() {
    let harness = Harness::new();
    harness.append(3).await;
    let producer = Arc::new(RecordingProducer::new());
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    let advanced = publisher.publish_notifications().await.expect("publishes");
    assert_eq!(advanced, Some(3));
    assert_eq!(producer.published_message_ids(), vec!["1", "2", "3"]);
    assert_eq!(harness.tracker_store.cursor(), Some(3));

    // Every published body is the notification envelope.
    let first = &producer.published()[0];
    assert_eq!(first.type_name, "order.placed");
    let envelope: serde_json::Value = serde_json::from_str(&first.body).expect("valid json");
    assert_eq!(envelope["id"], 1);
    assert_eq!(envelope["event"]["name"], "order.placed");
}

#[tokio::test]
async fn nothing_to_publish_returns_none() {
    let harness = Harness::new();
    let producer = Arc::new(RecordingProducer::new());
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    let advanced = publisher.publish_notifications().await.expect("runs");
    assert_eq!(advanced, None);
    assert!(producer.published().is_empty());
    assert_eq!(harness.tracker_store.cursor(), None);
}

#[tokio::test]
async fn a_second_run_publishes_only_new_events() {
    let harness = Harness::new();
    harness.append(2).await;
    let producer = Arc::new(RecordingProducer::new());
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    assert_eq!(
        publisher.publish_notifications().await.expect("publishes"),
        Some(2)
    );
    harness.append(1).await;
    assert_eq!(
        publisher.publish_notifications().await.expect("publishes"),
        Some(3)
    );
    assert_eq!(producer.published_message_ids(), vec!["1", "2", "3"]);
    assert_eq!(
        publisher
            .get_last_published_notification_id()
            .await
            .expect("reads"),
        Some(3)
    );
}

#[tokio::test]
async fn not_ready_producer_fails_fast_and_leaves_the_cursor() {
    let harness = Harness::new();
    harness.append(2).await;
    let producer = Arc::new(RecordingProducer::new());
    producer.set_ready(false);
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    assert!(!publisher.is_ready());
    let result = publisher.publish_notifications().await;
    assert!(matches!(result, Err(PublishError::ProducerNotReady)));
    assert!(producer.published().is_empty());
    assert_eq!(harness.tracker_store.cursor(), None);
}

#[tokio::test]
async fn partial_failure_leaves_the_cursor_and_the_next_run_redrives() {
    let harness = Harness::new();
    harness.append(5).await;
    // Fail publishing the third notification (index 2).
    let producer = Arc::new(FlakyProducer::failing_at(2));
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    let result = publisher.publish_notifications().await;
    match result {
        Err(PublishError::Publish { id, .. }) => assert_eq!(id, 3),
        other => panic!("expected publish failure, got {other:?}"),
    }
    // Items before the failure went out, but the cursor did not move.
    assert_eq!(producer.published_message_ids(), vec!["1", "2"]);
    assert_eq!(harness.tracker_store.cursor(), None);

    // The next run re-publishes the whole batch from the original
    // cursor, including the items that already went out - at-least-once.
    let advanced = publisher.publish_notifications().await.expect("redrives");
    assert_eq!(advanced, Some(5));
    assert_eq!(
        producer.published_message_ids(),
        vec!["1", "2", "1", "2", "3", "4", "5"]
    );
    assert_eq!(harness.tracker_store.cursor(), Some(5));
}

#[tokio::test]
async fn cursor_never_regresses_across_runs() {
    let harness = Harness::new();
    harness.append(4).await;
    let producer = Arc::new(RecordingProducer::new());
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    let mut last_cursor = 0;
    for _ in 0..3 {
        publisher.publish_notifications().await.expect("runs");
        let cursor = harness.tracker_store.cursor().unwrap_or(0);
        assert!(cursor >= last_cursor, "cursor regressed: {cursor} < {last_cursor}");
        last_cursor = cursor;
    }
    assert_eq!(last_cursor, 4);
}

#[tokio::test]
async fn corrupt_stored_event_aborts_the_whole_batch() {
    let harness = Harness::new();
    harness.append(3).await;
    harness.store.corrupt_body(2, "this is not json");
    let producer = Arc::new(RecordingProducer::new());
    let publisher = harness.publisher(Arc::clone(&producer) as Arc<dyn NotificationProducer>);

    let result = publisher.publish_notifications().await;
    match result {
        Err(PublishError::CorruptStoredEvent { id, .. }) => assert_eq!(id, 2),
        other => panic!("expected corrupt-event failure, got {other:?}"),
    }
    // Abort-the-batch: nothing was published, not even the valid first
    // event, and the cursor is untouched.
    assert!(producer.published().is_empty());
    assert_eq!(harness.tracker_store.cursor(), None);
}

#[tokio::test]
async fn concurrent_first_use_of_the_tracker_is_idempotent() {
    let harness = Harness::new();
    let first = harness
        .tracker_store
        .published_notification_tracker()
        .await
        .expect("creates");
    let second = harness
        .tracker_store
        .published_notification_tracker()
        .await
        .expect("idempotent");
    assert_eq!(
        first.most_recent_published_notification_id(),
        second.most_recent_published_notification_id()
    );
}
