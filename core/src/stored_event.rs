//! Stored events - the append-only persistence record of a domain event.
//!
//! A [`StoredEvent`] pairs a serialized domain event body with the
//! monotonic id the event store assigned at append time. Stored events are
//! created only by an [`crate::event_store::EventStore`] implementation,
//! never mutated and never deleted by this core (retention is an external
//! concern).

use crate::assert;
use crate::event::{DomainEvent, EventError, EventSerializer};
use chrono::{DateTime, Utc};

/// Maximum length, in characters, of a stored event's type name.
pub const MAX_TYPE_NAME_LEN: usize = 100;

/// Maximum length, in characters, of a stored event's serialized body.
pub const MAX_BODY_LEN: usize = 65_000;

/// A persisted domain event with its store-assigned id.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    id: i64,
    type_name: String,
    body: String,
    occurred_on: DateTime<Utc>,
}

impl StoredEvent {
    /// Creates a stored event from already-serialized parts.
    ///
    /// Intended for event-store implementations reading rows back out of
    /// storage or wrapping a fresh insert.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Validation`] when the type name is empty or
    /// longer than [`MAX_TYPE_NAME_LEN`] characters, or when the body is
    /// empty or longer than [`MAX_BODY_LEN`] characters.
    pub fn new(
        id: i64,
        type_name: String,
        body: String,
        occurred_on: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        assert::not_empty("event type name", &type_name)?;
        assert::length("event type name", &type_name, 1, MAX_TYPE_NAME_LEN)?;
        assert::length("event body", &body, 1, MAX_BODY_LEN)?;
        Ok(Self {
            id,
            type_name,
            body,
            occurred_on,
        })
    }

    /// Serializes `event` and wraps it with the id the store assigned.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] when the event body cannot be
    /// rendered, or [`EventError::Validation`] when the rendered parts
    /// violate the length limits.
    pub fn from_domain_event(
        id: i64,
        event: &DomainEvent,
        serializer: &EventSerializer,
    ) -> Result<Self, EventError> {
        let body = serializer.serialize(event)?;
        Self::new(id, event.type_name().to_string(), body, event.occurred_on())
    }

    /// The monotonic id assigned by the event store.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// The stored event's type name (the domain event's name).
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The serialized domain-event body.
    #[must_use]
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The instant the wrapped domain event occurred.
    #[must_use]
    pub const fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    /// Reads the body back into the domain event it was created from.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] when the body is corrupt.
    pub fn to_domain_event(&self, serializer: &EventSerializer) -> Result<DomainEvent, EventError> {
        serializer.deserialize(&self.body)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code uses expect for clear failure messages
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_through_domain_event() {
        let event = DomainEvent::new("order.placed", 1, json!({ "order_id": "o-1" }))
            .expect("valid event");
        let serializer = EventSerializer::new();

        let stored =
            StoredEvent::from_domain_event(7, &event, &serializer).expect("valid stored event");
        assert_eq!(stored.id(), 7);
        assert_eq!(stored.type_name(), "order.placed");

        let restored = stored.to_domain_event(&serializer).expect("deserializes");
        assert_eq!(restored.name(), event.name());
        assert_eq!(restored.prop("order_id"), event.prop("order_id"));
    }

    #[test]
    fn rejects_oversized_type_name() {
        let result = StoredEvent::new(1, "x".repeat(101), "{}".to_string(), Utc::now());
        assert!(matches!(result, Err(EventError::Validation(_))));
    }

    #[test]
    fn rejects_empty_body() {
        let result = StoredEvent::new(1, "order.placed".to_string(), String::new(), Utc::now());
        assert!(matches!(result, Err(EventError::Validation(_))));
    }
}
