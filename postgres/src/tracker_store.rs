//! PostgreSQL-backed published-notification tracker store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE published_notification_tracker (
//!     type_name                              VARCHAR(100) PRIMARY KEY,
//!     most_recent_published_notification_id  BIGINT,
//!     concurrency_version                    INT NOT NULL DEFAULT 0
//! );
//! ```
//!
//! Lazy creation uses `INSERT … ON CONFLICT DO NOTHING`, which is what
//! makes concurrent first use idempotent: both racers end up reading the
//! same row.

use eventline_core::tracker::PublishedNotificationTrackerStore;
use eventline_core::{Notification, PublishedNotificationTracker, TrackerError};
use sqlx::postgres::PgPool;
use std::future::Future;
use std::pin::Pin;

fn storage_error(error: sqlx::Error) -> TrackerError {
    TrackerError::Storage(error.to_string())
}

/// The production [`PublishedNotificationTrackerStore`]; one instance per
/// topic.
#[derive(Clone)]
pub struct PostgresPublishedNotificationTrackerStore {
    pool: PgPool,
    type_name: String,
}

impl PostgresPublishedNotificationTrackerStore {
    /// Creates a store for `type_name` over an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::Validation`] when `type_name` violates the
    /// tracker's topic-name limits.
    pub fn new(pool: PgPool, type_name: &str) -> Result<Self, TrackerError> {
        // Validate eagerly; the same checks guard the value object.
        PublishedNotificationTracker::new(type_name)?;
        Ok(Self {
            pool,
            type_name: type_name.to_string(),
        })
    }
}

impl PublishedNotificationTrackerStore for PostgresPublishedNotificationTrackerStore {
    fn published_notification_tracker(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<PublishedNotificationTracker, TrackerError>> + Send + '_>>
    {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO published_notification_tracker (type_name)
                 VALUES ($1)
                 ON CONFLICT (type_name) DO NOTHING",
            )
            .bind(&self.type_name)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

            let (cursor, concurrency_version): (Option<i64>, i32) = sqlx::query_as(
                "SELECT most_recent_published_notification_id, concurrency_version
                 FROM published_notification_tracker
                 WHERE type_name = $1",
            )
            .bind(&self.type_name)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

            match cursor {
                Some(id) => PublishedNotificationTracker::with_most_recent(
                    &self.type_name,
                    id,
                    concurrency_version,
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

            sqlx::query(
                "UPDATE published_notification_tracker
                 SET most_recent_published_notification_id = $1,
                     concurrency_version = concurrency_version + 1
                 WHERE type_name = $2",
            )
            .bind(last.id())
            .bind(tracker.type_name())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

            tracing::debug!(
                topic = %tracker.type_name(),
                cursor = last.id(),
                "publication cursor advanced"
            );
            Ok(Some(last.id()))
        })
    }

    fn type_name(&self) -> &str {
        &self.type_name
    }
}
