//! The outbox drain loop.
//!
//! `publish_notifications` drains everything the event store has recorded
//! past the topic's cursor, publishes each event as a durable text
//! notification, and advances the cursor only after the whole batch went
//! out:
//!
//! 1. fail fast when the producer is not ready - the cursor is never
//!    touched;
//! 2. load (lazily creating) the tracker and read its cursor;
//! 3. fetch all stored events past the cursor;
//! 4. deserialize every body back into its domain event *before*
//!    publishing anything - one corrupt event aborts the whole batch, so
//!    there is no partial publish and no silent data loss;
//! 5. publish in ascending id order, awaiting each publish, stopping at
//!    the first failure;
//! 6. on full success, advance the cursor to the last notification's id.
//!
//! A failed batch leaves the cursor where it was, so the next invocation
//! re-fetches and re-publishes the same events - that is the at-least-once
//! guarantee, and it is why the consumer side deduplicates on message id.

use eventline_core::{
    EventError, EventSerializer, EventStore, EventStoreError, MessagingError, Notification,
    NotificationProducer, NotificationSerializer, PublishableNotification, TrackerError,
};
use eventline_core::tracker::PublishedNotificationTrackerStore;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a publication run.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The producer's broker component is not declared/ready; nothing was
    /// read and the cursor was not touched.
    #[error("message producer is not ready")]
    ProducerNotReady,

    /// Reading from the event store failed.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Loading or advancing the tracker failed.
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    /// A stored event could not be turned back into a valid notification;
    /// the batch was aborted before any publish.
    #[error("stored event {id} could not be converted to a notification: {source}")]
    CorruptStoredEvent {
        /// The offending stored-event id - the repair target.
        id: i64,
        /// Why the conversion failed.
        source: EventError,
    },

    /// Publishing notification `id` failed; the cursor was not advanced.
    #[error("publish failed for notification {id}: {source}")]
    Publish {
        /// The notification that failed.
        id: i64,
        /// The messaging failure.
        source: MessagingError,
    },
}

/// Drains the event store to the broker and tracks publication progress.
///
/// Built from the port traits so storage and transport are injected; one
/// publisher instance serves one topic (the tracker store's topic), and
/// only one instance per topic may run - the cursor's read-modify-write
/// relies on that single-writer discipline.
pub struct NotificationPublisher {
    event_store: Arc<dyn EventStore>,
    tracker_store: Arc<dyn PublishedNotificationTrackerStore>,
    producer: Arc<dyn NotificationProducer>,
    event_serializer: EventSerializer,
    notification_serializer: NotificationSerializer,
}

impl NotificationPublisher {
    /// Creates a publisher over the given store, tracker store and
    /// producer.
    #[must_use]
    pub const fn new(
        event_store: Arc<dyn EventStore>,
        tracker_store: Arc<dyn PublishedNotificationTrackerStore>,
        producer: Arc<dyn NotificationProducer>,
    ) -> Self {
        Self {
            event_store,
            tracker_store,
            producer,
            event_serializer: EventSerializer::new(),
            notification_serializer: NotificationSerializer::new(),
        }
    }

    /// Publishes every stored event past the topic's cursor, advancing
    /// the cursor after full success.
    ///
    /// Returns the advanced cursor id, or `None` when there was nothing
    /// to publish.
    ///
    /// # Errors
    ///
    /// Any [`PublishError`]; in every error case the cursor is left
    /// exactly where it was, so the next invocation safely re-drives the
    /// same batch.
    pub async fn publish_notifications(&self) -> Result<Option<i64>, PublishError> {
        if !self.producer.is_ready_for_publish() {
            return Err(PublishError::ProducerNotReady);
        }

        let tracker = self.tracker_store.published_notification_tracker().await?;
        let cursor = tracker.most_recent_published_notification_id().unwrap_or(0);
        let stored_events = self.event_store.all_stored_events_since(cursor).await?;
        if stored_events.is_empty() {
            tracing::debug!(topic = %tracker.type_name(), cursor, "nothing to publish");
            return Ok(None);
        }

        // Deserialize the whole batch first; a corrupt stored event
        // aborts before anything reaches the broker.
        let mut notifications = Vec::with_capacity(stored_events.len());
        for stored_event in &stored_events {
            let notification =
                Notification::from_stored_event(stored_event, &self.event_serializer).map_err(
                    |source| PublishError::CorruptStoredEvent {
                        id: stored_event.id(),
                        source,
                    },
                )?;
            notifications.push(notification);
        }

        for notification in &notifications {
            let body = self
                .notification_serializer
                .serialize(notification)
                .map_err(|source| PublishError::CorruptStoredEvent {
                    id: notification.id(),
                    source,
                })?;
            self.producer
                .publish(PublishableNotification {
                    type_name: notification.type_name().to_string(),
                    message_id: notification.id().to_string(),
                    timestamp: notification.occurred_on(),
                    body,
                })
                .await
                .map_err(|source| PublishError::Publish {
                    id: notification.id(),
                    source,
                })?;
            metrics::counter!("eventline_notifications_published_total").increment(1);
            tracing::debug!(
                id = notification.id(),
                message_type = %notification.type_name(),
                "notification published"
            );
        }

        let advanced = self
            .tracker_store
            .track_most_recent_published_notification(tracker, &notifications)
            .await?;
        tracing::info!(
            topic = %self.tracker_store.type_name(),
            published = notifications.len(),
            advanced_to = advanced,
            "notification batch published"
        );
        Ok(advanced)
    }

    /// Whether the producer's broker component is ready for a drain run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.producer.is_ready_for_publish()
    }

    /// The topic's current cursor, without publishing anything.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Tracker`] when the tracker cannot be
    /// loaded.
    pub async fn get_last_published_notification_id(&self) -> Result<Option<i64>, PublishError> {
        let tracker = self.tracker_store.published_notification_tracker().await?;
        Ok(tracker.most_recent_published_notification_id())
    }
}
