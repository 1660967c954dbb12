//! PostgreSQL-backed event-handling (dedup) tracker.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE handled_notifications (
//!     message_id  TEXT PRIMARY KEY,
//!     handled     BOOLEAN NOT NULL,
//!     handled_at  TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The table is shared by every consumer process; the primary-key upsert
//! gives the concurrent-safe writes the dedup contract needs. Keys are
//! prefixed per tracker so unrelated listeners sharing a database do not
//! collide. `handled_at` exists purely for retention: run
//! `purge_handled_before` from an operator job aligned with broker
//! message expiry.

use chrono::{DateTime, Utc};
use eventline_core::{EventHandlingTracker, HandlingTrackerError};
use sqlx::postgres::PgPool;
use std::future::Future;
use std::pin::Pin;

const DEFAULT_PREFIX: &str = "notification_tracker";

fn storage_error(error: sqlx::Error) -> HandlingTrackerError {
    HandlingTrackerError::Storage(error.to_string())
}

/// The production [`EventHandlingTracker`].
#[derive(Clone)]
pub struct PostgresEventHandlingTracker {
    pool: PgPool,
    prefix: String,
}

impl PostgresEventHandlingTracker {
    /// Creates a tracker with the default key prefix.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self::with_prefix(pool, DEFAULT_PREFIX)
    }

    /// Creates a tracker whose keys are prefixed with `prefix`, for
    /// listeners sharing a database.
    #[must_use]
    pub fn with_prefix(pool: PgPool, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, message_id: &str) -> String {
        format!("{}_{message_id}", self.prefix)
    }

    async fn set_handled(&self, message_id: &str, handled: bool) -> Result<(), HandlingTrackerError> {
        sqlx::query(
            "INSERT INTO handled_notifications (message_id, handled, handled_at)
             VALUES ($1, $2, now())
             ON CONFLICT (message_id) DO UPDATE
             SET handled = EXCLUDED.handled, handled_at = now()",
        )
        .bind(self.key(message_id))
        .bind(handled)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }
}

impl EventHandlingTracker for PostgresEventHandlingTracker {
    fn is_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move {
            let row: Option<(bool,)> =
                sqlx::query_as("SELECT handled FROM handled_notifications WHERE message_id = $1")
                    .bind(self.key(message_id))
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(storage_error)?;
            Ok(row.is_some_and(|(handled,)| handled))
        })
    }

    fn mark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move { self.set_handled(message_id, true).await })
    }

    fn unmark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>> {
        Box::pin(async move { self.set_handled(message_id, false).await })
    }

    fn purge_handled_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, HandlingTrackerError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM handled_notifications
                 WHERE handled_at < $1 AND starts_with(message_id, $2)",
            )
            .bind(cutoff)
            .bind(format!("{}_", self.prefix))
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
            tracing::info!(purged = result.rows_affected(), "dedup entries purged");
            Ok(result.rows_affected())
        })
    }
}
