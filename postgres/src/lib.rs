//! # Eventline Postgres
//!
//! `PostgreSQL` implementations of the Eventline ports, built on sqlx:
//!
//! - [`PostgresEventStore`] - the append-only stored-events log
//! - [`PostgresPublishedNotificationTrackerStore`] - the publication
//!   cursor, one row per topic
//! - [`PostgresEventHandlingTracker`] - the consumer-side dedup set
//!
//! All three share one schema (see `migrations/`) and can share one
//! connection pool. `append` runs inside its own transaction; callers
//! with a wider unit of work use
//! [`PostgresEventStore::append_in_transaction`] to make the event row
//! part of their own commit.
//!
//! # Example
//!
//! ```ignore
//! use eventline_postgres::PostgresEventStore;
//!
//! let store = PostgresEventStore::connect("postgres://localhost/eventline").await?;
//! store.migrate().await?;
//! ```

pub mod event_store;
pub mod handling;
pub mod tracker_store;

pub use event_store::PostgresEventStore;
pub use handling::PostgresEventHandlingTracker;
pub use tracker_store::PostgresPublishedNotificationTrackerStore;
