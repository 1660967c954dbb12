//! In-memory implementations of the core ports.
//!
//! Deterministic, lock-based, and cheap: the event store assigns ids
//! 1, 2, 3, … in append order, the tracker store keeps its row in a
//! mutex, and the producers record what they were asked to publish so
//! tests can assert on ordering and cursor discipline.

use chrono::{DateTime, Utc};
use eventline_core::tracker::PublishedNotificationTrackerStore;
use eventline_core::{
    DomainEvent, EventHandlingTracker, EventSerializer, EventStore, EventStoreError,
    HandlingTrackerError, MessagingError, Notification, NotificationProducer,
    PublishableNotification, PublishedNotificationTracker, StoredEvent, TrackerError,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

fn unpoisoned<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Append-only event store held in a `Vec`.
///
/// Ids are assigned 1, 2, 3, … in append order, which makes the ordering
/// properties directly checkable.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
    serializer: EventSerializer,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the body of the stored event with `id`, for corrupt-data
    /// scenarios. No-op when the id does not exist.
    pub fn corrupt_body(&self, id: i64, body: &str) {
        let mut events = unpoisoned(self.events.lock());
        if let Some(index) = events.iter().position(|event| event.id() == id) {
            if let Ok(corrupted) = StoredEvent::new(
                id,
                events[index].type_name().to_string(),
                body.to_string(),
                events[index].occurred_on(),
            ) {
                events[index] = corrupted;
            }
        }
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let body = self
                .serializer
                .serialize(&event)
                .map_err(|error| EventStoreError::Serialization {
                    type_name: event.type_name().to_string(),
                    reason: error.to_string(),
                })?;
            let mut events = unpoisoned(self.events.lock());
            let id = i64::try_from(events.len())
                .map_err(|_| EventStoreError::Storage("store is full".to_string()))?
                + 1;
            let stored = StoredEvent::new(id, event.type_name().to_string(), body, event.occurred_on())
                .map_err(|error| EventStoreError::InvalidRow {
                    id,
                    reason: error.to_string(),
                })?;
            events.push(stored.clone());
            Ok(stored)
        })
    }

    fn all_stored_events_since(
        &self,
        stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let events = unpoisoned(self.events.lock());
            Ok(events
                .iter()
                .filter(|event| event.id() > stored_event_id)
                .cloned()
                .collect())
        })
    }

    fn all_stored_events_between(
        &self,
        low_stored_event_id: i64,
        high_stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let events = unpoisoned(self.events.lock());
            Ok(events
                .iter()
                .filter(|event| {
                    event.id() >= low_stored_event_id && event.id() <= high_stored_event_id
                })
                .cloned()
                .collect())
        })
    }

    fn count_events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let events = unpoisoned(self.events.lock());
            i64::try_from(events.len()).map_err(|_| EventStoreError::Storage("overflow".to_string()))
        })
    }
}

#[derive(Default)]
struct TrackerRow {
    exists: bool,
    cursor: Option<i64>,
    concurrency_version: i32,
}

/// Tracker store for one topic, held in a mutex.
pub struct InMemoryPublishedNotificationTrackerStore {
    type_name: String,
    row: Mutex<TrackerRow>,
}

impl InMemoryPublishedNotificationTrackerStore {
    /// Creates a store for `type_name`.
    #[must_use]
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            row: Mutex::new(TrackerRow::default()),
        }
    }

    /// The persisted cursor, for assertions.
    #[must_use]
    pub fn cursor(&self) -> Option<i64> {
        unpoisoned(self.row.lock()).cursor
    }

    /// The persisted concurrency version, for assertions.
    #[must_use]
    pub fn concurrency_version(&self) -> i32 {
        unpoisoned(self.row.lock()).concurrency_version
    }
}

impl PublishedNotificationTrackerStore for InMemoryPublishedNotificationTrackerStore {
    fn published_notification_tracker(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PublishedNotificationTracker, TrackerError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut row = unpoisoned(self.row.lock());
            row.exists = true;
            match row.cursor {
                Some(cursor) => PublishedNotificationTracker::with_most_recent(
                    &self.type_name,
                    cursor,
                    row.concurrency_version,
                ),
                None => PublishedNotificationTracker::new(&self.type_name),
            }
        })
    }

    fn track_most_recent_published_notification<'a>(
        &'a self,
        tracker: PublishedNotificationTracker,
        notifications: &'a [Notification],
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, TrackerError>> + Send + 'a>> {
        Box::pin(async move {
            let Some(last) = notifications.last() else {
                return Ok(None);
            };
            let mut tracker = tracker;
            tracker.set_most_recent_published_notification_id(last.id())?;
            let mut row = unpoisoned(self.row.lock());
            row.cursor = tracker.most_recent_published_notification_id();
            row.concurrency_version += 1;
            Ok(Some(last.id()))
        })
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }
}

/// Dedup tracker held in a `HashMap`.
#[derive(Default)]
pub struct InMemoryEventHandlingTracker {
    entries: Mutex<HashMap<String, (bool, DateTime<Utc>)>>,
}

impl InMemoryEventHandlingTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many ids are currently marked handled.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        unpoisoned(self.entries.lock())
            .values()
            .filter(|(handled, _)| *handled)
            .count()
    }
}

impl EventHandlingTracker for InMemoryEventHandlingTracker {
    fn is_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(unpoisoned(self.entries.lock())
                .get(message_id)
                .is_some_and(|(handled, _)| *handled))
        })
    }

    fn mark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move {
            unpoisoned(self.entries.lock()).insert(message_id.to_string(), (true, Utc::now()));
            Ok(())
        })
    }

    fn unmark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move {
            unpoisoned(self.entries.lock()).insert(message_id.to_string(), (false, Utc::now()));
            Ok(())
        })
    }

    fn purge_handled_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, HandlingTrackerError>> + Send + '_>> {
        Box::pin(async move {
            let mut entries = unpoisoned(self.entries.lock());
            let before = entries.len();
            entries.retain(|_, (_, marked_at)| *marked_at >= cutoff);
            Ok(u64::try_from(before.saturating_sub(entries.len())).unwrap_or(u64::MAX))
        })
    }
}

/// Producer that records everything it is asked to publish.
pub struct RecordingProducer {
    ready: AtomicBool,
    published: Mutex<Vec<PublishableNotification>>,
}

impl Default for RecordingProducer {
    fn default() -> Self {
        Self {
            ready: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingProducer {
    /// Creates a ready producer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the producer's readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishableNotification> {
        unpoisoned(self.published.lock()).clone()
    }

    /// The `message_id`s published so far, in order.
    #[must_use]
    pub fn published_message_ids(&self) -> Vec<String> {
        unpoisoned(self.published.lock())
            .iter()
            .map(|notification| notification.message_id.clone())
            .collect()
    }
}

impl NotificationProducer for RecordingProducer {
    fn is_ready_for_publish(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn publish(
        &self,
        notification: PublishableNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            unpoisoned(self.published.lock()).push(notification);
            Ok(())
        })
    }
}

/// Producer that fails exactly one publish attempt, then behaves.
///
/// `fail_at` is a zero-based index into the global sequence of publish
/// attempts; the failing attempt records nothing. Built for the
/// no-cursor-advance-on-partial-failure property.
pub struct FlakyProducer {
    inner: RecordingProducer,
    fail_at: Mutex<Option<usize>>,
    attempts: AtomicUsize,
}

impl FlakyProducer {
    /// Creates a producer that will fail attempt number `fail_at`
    /// (zero-based).
    #[must_use]
    pub fn failing_at(fail_at: usize) -> Self {
        Self {
            inner: RecordingProducer::new(),
            fail_at: Mutex::new(Some(fail_at)),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Total publish attempts seen, including the failed one.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Everything successfully published, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishableNotification> {
        self.inner.published()
    }

    /// The `message_id`s successfully published, in order.
    #[must_use]
    pub fn published_message_ids(&self) -> Vec<String> {
        self.inner.published_message_ids()
    }
}

impl NotificationProducer for FlakyProducer {
    fn is_ready_for_publish(&self) -> bool {
        self.inner.is_ready_for_publish()
    }

    fn publish(
        &self,
        notification: PublishableNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let should_fail = {
                let mut fail_at = unpoisoned(self.fail_at.lock());
                if *fail_at == Some(attempt) {
                    *fail_at = None;
                    true
                } else {
                    false
                }
            };
            if should_fail {
                return Err(MessagingError::PublishFailed {
                    target: notification.type_name,
                    reason: "injected failure".to_string(),
                });
            }
            self.inner.publish(notification).await
        })
    }
}
