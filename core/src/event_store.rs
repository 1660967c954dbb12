//! Event store port - the append-only, strictly ordered log of domain
//! events.
//!
//! The store is the leaf persistence primitive of the pipeline: `append`
//! runs in the same transactional scope as the caller's unit of work, and
//! the read operations are linearizable with respect to the store's own id
//! assignment (no replica-staleness assumptions are made inside this core).
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventline-postgres`): production
//! - `InMemoryEventStore` (in `eventline-testing`): fast, deterministic
//!   tests
//!
//! # Ordering contract
//!
//! Ids are strictly increasing in append order and gap-free from the
//! store's perspective. `all_stored_events_since(n)` returns exactly the
//! events with id > n, ascending; `all_stored_events_between(low, high)`
//! returns the closed interval `[low, high]`, ascending.

use crate::event::DomainEvent;
use crate::stored_event::StoredEvent;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The domain event could not be serialized; nothing was written.
    #[error("failed to serialize event '{type_name}': {reason}")]
    Serialization {
        /// The event type being appended.
        type_name: String,
        /// The underlying failure.
        reason: String,
    },

    /// A stored row violates the stored-event invariants.
    #[error("stored event {id} is invalid: {reason}")]
    InvalidRow {
        /// The id of the offending row.
        id: i64,
        /// Why the row could not be loaded.
        reason: String,
    },

    /// Database connection or query failure; nothing was written.
    #[error("storage error: {0}")]
    Storage(String),
}

/// The append-only event store.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; the outbox publisher holds the
/// store as `Arc<dyn EventStore>` and drives it from async tasks.
pub trait EventStore: Send + Sync {
    /// Serializes `event` and appends it, returning the stored record with
    /// its assigned id.
    ///
    /// On any failure no partial write remains.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::Serialization`] when the body cannot be
    ///   rendered
    /// - [`EventStoreError::Storage`] when the write fails
    fn append(
        &self,
        event: DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<StoredEvent, EventStoreError>> + Send + '_>>;

    /// Returns every stored event with id strictly greater than
    /// `stored_event_id`, in ascending id order, with no upper bound.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when the read fails, or
    /// [`EventStoreError::InvalidRow`] when a row cannot be loaded.
    fn all_stored_events_since(
        &self,
        stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Returns the stored events with ids in the closed interval
    /// `[low_stored_event_id, high_stored_event_id]`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when the read fails, or
    /// [`EventStoreError::InvalidRow`] when a row cannot be loaded.
    fn all_stored_events_between(
        &self,
        low_stored_event_id: i64,
        high_stored_event_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, EventStoreError>> + Send + '_>>;

    /// Returns the total number of stored events.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::Storage`] when the read fails.
    fn count_events(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<i64, EventStoreError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_error_display_names_the_type() {
        let error = EventStoreError::Serialization {
            type_name: "order.placed".to_string(),
            reason: "bad float".to_string(),
        };
        let display = format!("{error}");
        assert!(display.contains("order.placed"));
        assert!(display.contains("bad float"));
    }

    #[test]
    fn event_store_is_dyn_compatible() {
        fn assert_dyn(_: Option<&dyn EventStore>) {}
        assert_dyn(None);
    }
}
