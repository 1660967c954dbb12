//! Notifications - the wire envelope for publishing stored events.
//!
//! A [`Notification`] pairs a domain event with the id of the stored event
//! it was derived from. The id is the ordering and deduplication key for
//! downstream consumers: it equals the stored event's id, always, though
//! consumers must not assume the sequence is gap-free.
//!
//! # Wire format
//!
//! ```json
//! { "id": 42, "event": { "name": "...", "version": 1,
//!   "occurred_on": "2026-03-01T09:30:00Z", "props": { } } }
//! ```

use crate::assert;
use crate::event::{DomainEvent, EventError, EventSerializer};
use crate::stored_event::{MAX_TYPE_NAME_LEN, StoredEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire envelope wrapping a domain event with its store id.
///
/// Built 1:1 from a [`StoredEvent`]; the type name, version and
/// occurred-on instant are those of the wrapped event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    id: i64,
    event: DomainEvent,
}

impl Notification {
    /// Creates a notification for the stored event with id `id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Validation`] when `id` is not positive or the
    /// event's name exceeds [`MAX_TYPE_NAME_LEN`] characters.
    pub fn new(id: i64, event: DomainEvent) -> Result<Self, EventError> {
        assert::larger_than("notification id", id, 0)?;
        assert::length("notification type name", event.type_name(), 1, MAX_TYPE_NAME_LEN)?;
        Ok(Self { id, event })
    }

    /// Deserializes a stored event's body and wraps it with the stored
    /// event's id.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] when the stored body is
    /// corrupt, and [`EventError::Validation`] when the resulting envelope
    /// would be invalid.
    pub fn from_stored_event(
        stored_event: &StoredEvent,
        serializer: &EventSerializer,
    ) -> Result<Self, EventError> {
        let event = stored_event.to_domain_event(serializer)?;
        Self::new(stored_event.id(), event)
    }

    /// The stored-event id this notification was derived from.
    #[must_use]
    pub const fn id(&self) -> i64 {
        self.id
    }

    /// The wrapped domain event.
    #[must_use]
    pub const fn event(&self) -> &DomainEvent {
        &self.event
    }

    /// The wrapped event's name, used as the broker message type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        self.event.type_name()
    }

    /// The wrapped event's schema version.
    #[must_use]
    pub const fn version(&self) -> i32 {
        self.event.version()
    }

    /// The instant the wrapped event occurred.
    #[must_use]
    pub const fn occurred_on(&self) -> DateTime<Utc> {
        self.event.occurred_on()
    }
}

/// Fallible JSON serializer for the notification envelope.
#[derive(Clone, Copy, Debug, Default)]
pub struct NotificationSerializer;

impl NotificationSerializer {
    /// Creates a serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Renders `notification` to its JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] when the envelope cannot be
    /// rendered.
    pub fn serialize(&self, notification: &Notification) -> Result<String, EventError> {
        serde_json::to_string(notification).map_err(|e| EventError::Serialization {
            type_name: notification.type_name().to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads a JSON envelope back into a [`Notification`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] for malformed envelopes and
    /// [`EventError::Validation`] when the parsed envelope is invalid.
    pub fn deserialize(&self, json: &str) -> Result<Notification, EventError> {
        let parsed: Notification =
            serde_json::from_str(json).map_err(|e| EventError::Deserialization(e.to_string()))?;
        // Re-run construction checks; serde bypasses them.
        Notification::new(parsed.id, parsed.event)
    }
}

/// Read-side helper over a notification JSON document.
///
/// Consumers doing message-based context mapping often need a handful of
/// typed values out of a foreign event without modeling its full schema.
/// The reader navigates dot-separated paths below the envelope's `event`
/// object:
///
/// ```
/// use eventline_core::notification::NotificationReader;
///
/// # fn main() -> Result<(), eventline_core::event::EventError> {
/// let json = r#"{ "id": 7, "event": { "name": "order.placed", "version": 1,
///     "occurred_on": "2026-03-01T09:30:00Z",
///     "props": { "order": { "total_cents": 1250 } } } }"#;
///
/// let reader = NotificationReader::new(json)?;
/// assert_eq!(reader.notification_id(), Some(7));
/// assert_eq!(reader.event_i64_value("props.order.total_cents"), Some(1250));
/// assert_eq!(reader.event_string_value("name").as_deref(), Some("order.placed"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct NotificationReader {
    root: Value,
}

impl NotificationReader {
    /// Parses a notification JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] when the document is not
    /// valid JSON or has no `event` object.
    pub fn new(json: &str) -> Result<Self, EventError> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| EventError::Deserialization(e.to_string()))?;
        if !root.get("event").is_some_and(Value::is_object) {
            return Err(EventError::Deserialization(
                "notification document has no event object".to_string(),
            ));
        }
        Ok(Self { root })
    }

    /// The envelope's `id`, when present and integral.
    #[must_use]
    pub fn notification_id(&self) -> Option<i64> {
        self.root.get("id").and_then(Value::as_i64)
    }

    fn event_value(&self, path: &str) -> Option<&Value> {
        let mut current = self.root.get("event")?;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// A string value below the event at `path` (e.g. `"props.customer.id"`).
    #[must_use]
    pub fn event_string_value(&self, path: &str) -> Option<String> {
        self.event_value(path)?.as_str().map(str::to_string)
    }

    /// An integer value below the event at `path`.
    #[must_use]
    pub fn event_i64_value(&self, path: &str) -> Option<i64> {
        self.event_value(path)?.as_i64()
    }

    /// A float value below the event at `path`.
    #[must_use]
    pub fn event_f64_value(&self, path: &str) -> Option<f64> {
        self.event_value(path)?.as_f64()
    }

    /// A boolean value below the event at `path`.
    #[must_use]
    pub fn event_bool_value(&self, path: &str) -> Option<bool> {
        self.event_value(path)?.as_bool()
    }

    /// An ISO-8601 timestamp below the event at `path`.
    #[must_use]
    pub fn event_datetime_value(&self, path: &str) -> Option<DateTime<Utc>> {
        let raw = self.event_value(path)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc))
    }
}
