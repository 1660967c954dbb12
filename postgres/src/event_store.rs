//! PostgreSQL-backed event store.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE stored_events (
//!     id          BIGSERIAL PRIMARY KEY,
//!     type_name   VARCHAR(100) NOT NULL,
//!     body        TEXT NOT NULL,
//!     occurred_on TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! `BIGSERIAL` gives the strictly increasing, store-assigned ids the
//! ordering contract needs; reads order by `id` and are linearizable with
//! respect to that assignment on a single primary.

use chrono::{DateTime, Utc};
use eventline_core::{DomainEvent, EventSerializer, EventStore, EventStoreError, StoredEvent};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;

type EventRow = (i64, String, String, DateTime<Utc>);

fn row_to_stored_event(row: EventRow) -> Result<StoredEvent, EventStoreError> {
    let (id, type_name, body, occurred_on) = row;
    StoredEvent::new(id, type_name, body, occurred_on).map_err(|error| {
        EventStoreError::InvalidRow {
            id,
            reason: error.to_string(),
        }
    })
}

fn storage_error(error: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(error.to_string())
}

/// The production [`EventStore`].
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    serializer: EventSerializer,
}

impl PostgresEventStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            serializer: EventSerializer::new(),
        }
    }

    /// Connects a new pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage_error)?;
        Ok(Self::from_pool(pool))
    }

    /// Runs the crate's migrations (stored events, tracker, dedup set).
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| EventStoreError::Storage(error.to_string()))?;
        Ok(())
    }

    /// The underlying connection pool, for sharing with the tracker
    /// stores.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Appends `event` inside the caller's transaction, so the event row
    /// commits (or rolls back) with the caller's unit of work.
    ///
    /// # Errors
    ///
    /// As [`EventStore::append`].
    pub async fn append_in_transaction(
        &self,
        transaction: &mut Transaction<'_, Postgres>,
        event: DomainEvent,
    ) -> Result<StoredEvent, EventStoreError> {
        let body = self.serializer.serialize(&event).map_err(|error| {
            EventStoreError::Serialization {
                type_name: event.type_name().to_string(),
                reason: error.to_string(),
            }
        })?;
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO stored_events (type_name, body, occurred_on)
             VALUES ($1, $2, $3)
             RETURNING id",
        )
        .bind(event.type_name())
        .bind(&body)
        .bind(event.occurred_on())
        .fetch_one(&mut **transaction)
        .await
        .map_err(storage_error)?;

        metrics::counter!("eventline_events_appended_total").increment(1);
        tracing::debug!(id, message_type = %event.type_name(), "event appended");
        StoredEvent::new(id, event.type_name().to_string(), body, event.occurred_on()).map_err(
            |error| EventStoreError::InvalidRow {
                id,
                reason: error.to_string(),
            },
        )
    }
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut transaction = self.pool.begin().await.map_err(storage_error)?;
            let stored = self.append_in_transaction(&mut transaction, event).await?;
            transaction.commit().await.map_err(storage_error)?;
            Ok(stored)
        })
    }

    fn all_stored_events_since(
        &self,
        stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<EventRow> = sqlx::query_as(
                "SELECT id, type_name, body, occurred_on
                 FROM stored_events
                 WHERE id > $1
                 ORDER BY id ASC",
            )
            .bind(stored_event_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
            rows.into_iter().map(row_to_stored_event).collect()
        })
    }

    fn all_stored_events_between(
        &self,
        low_stored_event_id: i64,
        high_stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows: Vec<EventRow> = sqlx::query_as(
                "SELECT id, type_name, body, occurred_on
                 FROM stored_events
                 WHERE id >= $1 AND id <= $2
                 ORDER BY id ASC",
            )
            .bind(low_stored_event_id)
            .bind(high_stored_event_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;
            rows.into_iter().map(row_to_stored_event).collect()
        })
    }

    fn count_events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM stored_events")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(count)
        })
    }
}
