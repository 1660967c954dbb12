//! Published-notification tracker - the durable publication cursor.
//!
//! One tracker row exists per publishing topic (its `type_name`). The
//! tracker records the id of the most recently published notification so
//! the outbox publisher can resume draining where it left off. The cursor
//! never regresses and only advances to the id of the *last* notification
//! of a fully published batch; a failed batch leaves it untouched, which
//! is what makes republication (at-least-once) safe.

use crate::assert::{self, AssertionError};
use crate::notification::Notification;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Maximum length, in characters, of a tracker's topic name.
pub const MAX_TOPIC_NAME_LEN: usize = 100;

/// Errors raised by trackers and tracker stores.
#[derive(Error, Debug)]
pub enum TrackerError {
    /// A constructor or setter precondition was violated.
    #[error(transparent)]
    Validation(#[from] AssertionError),

    /// An attempt was made to move the cursor backwards.
    #[error("cursor for '{type_name}' cannot regress from {current} to {attempted}")]
    CursorRegression {
        /// The tracker's topic.
        type_name: String,
        /// The cursor before the attempt.
        current: i64,
        /// The id the caller tried to set.
        attempted: i64,
    },

    /// Database connection or query failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// The publication cursor for one topic.
///
/// Created lazily (with an absent cursor) on first use by the tracker
/// store; mutated only by the publisher after a fully successful batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedNotificationTracker {
    type_name: String,
    most_recent_published_notification_id: Option<i64>,
    concurrency_version: i32,
}

impl PublishedNotificationTracker {
    /// Creates a tracker with an absent cursor.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Validation`] when `type_name` is empty or
    /// longer than [`MAX_TOPIC_NAME_LEN`] characters.
    pub fn new(type_name: &str) -> Result<Self, TrackerError> {
        assert::not_empty("tracker topic name", type_name)?;
        assert::length("tracker topic name", type_name, 1, MAX_TOPIC_NAME_LEN)?;
        Ok(Self {
            type_name: type_name.to_string(),
            most_recent_published_notification_id: None,
            concurrency_version: 0,
        })
    }

    /// Creates a tracker with a known cursor, as loaded from storage.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Validation`] for an invalid topic name or a
    /// non-positive cursor id.
    pub fn with_most_recent(
        type_name: &str,
        most_recent_published_notification_id: i64,
        concurrency_version: i32,
    ) -> Result<Self, TrackerError> {
        let mut tracker = Self::new(type_name)?;
        tracker.set_most_recent_published_notification_id(most_recent_published_notification_id)?;
        tracker.concurrency_version = concurrency_version;
        Ok(tracker)
    }

    /// The topic this tracker belongs to.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The id of the most recently published notification, if any batch
    /// has completed yet.
    #[must_use]
    pub const fn most_recent_published_notification_id(&self) -> Option<i64> {
        self.most_recent_published_notification_id
    }

    /// The optimistic-concurrency version of the underlying row.
    #[must_use]
    pub const fn concurrency_version(&self) -> i32 {
        self.concurrency_version
    }

    /// Advances the cursor to `id`.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Validation`] when `id` is not positive and
    /// [`TrackerError::CursorRegression`] when `id` is smaller than the
    /// current cursor.
    pub fn set_most_recent_published_notification_id(
        &mut self,
        id: i64,
    ) -> Result<(), TrackerError> {
        assert::larger_than("notification id", id, 0)?;
        if let Some(current) = self.most_recent_published_notification_id {
            if id < current {
                return Err(TrackerError::CursorRegression {
                    type_name: self.type_name.clone(),
                    current,
                    attempted: id,
                });
            }
        }
        self.most_recent_published_notification_id = Some(id);
        Ok(())
    }
}

/// Durable storage for [`PublishedNotificationTracker`]s.
///
/// One store instance serves one topic; the single-writer discipline (one
/// publisher per topic) makes the read-modify-write of
/// [`track_most_recent_published_notification`] safe without locking.
///
/// [`track_most_recent_published_notification`]:
///     PublishedNotificationTrackerStore::track_most_recent_published_notification
pub trait PublishedNotificationTrackerStore: Send + Sync {
    /// Returns the tracker for this store's topic, creating one with an
    /// absent cursor if none exists yet. Creation is idempotent under
    /// concurrent first use.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Storage`] when the read or lazy create
    /// fails.
    fn published_notification_tracker(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PublishedNotificationTracker, TrackerError>> + Send + '_>>;

    /// Advances the tracker's cursor to the id of the **last** element of
    /// `notifications` (which the caller must pass in ascending id order)
    /// and persists it. A no-op returning `None` when `notifications` is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Validation`] / [`TrackerError::CursorRegression`]
    /// for an invalid advance, and [`TrackerError::Storage`] when the
    /// write fails.
    fn track_most_recent_published_notification<'a>(
        &'a self,
        tracker: PublishedNotificationTracker,
        notifications: &'a [Notification],
    ) -> Pin<Box<dyn Future<Output = Result<Option<i64>, TrackerError>> + Send + 'a>>;

    /// The topic this store serves.
    fn type_name(&self) -> &str;
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code uses expect for clear failure messages
mod tests {
    use super::*;

    #[test]
    fn new_tracker_has_absent_cursor() {
        let tracker = PublishedNotificationTracker::new("order-events").expect("valid tracker");
        assert_eq!(tracker.most_recent_published_notification_id(), None);
        assert_eq!(tracker.concurrency_version(), 0);
    }

    #[test]
    fn rejects_oversized_topic_name() {
        assert!(PublishedNotificationTracker::new(&"x".repeat(101)).is_err());
        assert!(PublishedNotificationTracker::new("").is_err());
    }

    #[test]
    fn cursor_rejects_non_positive_ids() {
        let mut tracker = PublishedNotificationTracker::new("order-events").expect("valid tracker");
        assert!(matches!(
            tracker.set_most_recent_published_notification_id(0),
            Err(TrackerError::Validation(_))
        ));
    }

    #[test]
    fn cursor_never_regresses() {
        let mut tracker = PublishedNotificationTracker::new("order-events").expect("valid tracker");
        tracker
            .set_most_recent_published_notification_id(10)
            .expect("advances");
        assert!(matches!(
            tracker.set_most_recent_published_notification_id(9),
            Err(TrackerError::CursorRegression { current: 10, attempted: 9, .. })
        ));
        // Re-setting the same id is allowed; republication is idempotent.
        tracker
            .set_most_recent_published_notification_id(10)
            .expect("same id is not a regression");
    }
}
