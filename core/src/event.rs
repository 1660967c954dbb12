//! Domain events and their JSON serialization.
//!
//! A [`DomainEvent`] is an immutable fact recorded by the business layer:
//! a name, a schema version, the moment it occurred and a free-form map of
//! properties. Identity is logical (name plus properties) - events carry no
//! primary key of their own; the event store assigns one when the event is
//! appended (see [`crate::stored_event::StoredEvent`]).
//!
//! # Wire format
//!
//! Events serialize to JSON and must round-trip without losing the name,
//! the occurred-on instant (to the second) or any property key:
//!
//! ```json
//! {
//!   "name": "customer.registered",
//!   "version": 1,
//!   "occurred_on": "2026-03-01T09:30:00Z",
//!   "props": { "customer_id": "c-42", "tier": "gold" }
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use eventline_core::event::{DomainEvent, EventSerializer};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), eventline_core::event::EventError> {
//! let event = DomainEvent::new(
//!     "customer.registered",
//!     1,
//!     json!({ "customer_id": "c-42" }),
//! )?;
//!
//! let serializer = EventSerializer::new();
//! let body = serializer.serialize(&event)?;
//! let restored = serializer.deserialize(&body)?;
//! assert_eq!(restored.name(), "customer.registered");
//! # Ok(())
//! # }
//! ```

use crate::assert::{self, AssertionError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors raised while constructing or (de)serializing events.
#[derive(Error, Debug)]
pub enum EventError {
    /// The event could not be rendered to its JSON body.
    #[error("failed to serialize event '{type_name}': {reason}")]
    Serialization {
        /// The event type being serialized.
        type_name: String,
        /// The underlying serde failure.
        reason: String,
    },

    /// A JSON body could not be read back into an event.
    #[error("failed to deserialize event: {0}")]
    Deserialization(String),

    /// A constructor precondition was violated.
    #[error(transparent)]
    Validation(#[from] AssertionError),
}

/// ISO-8601 timestamps with second precision, the envelope's wire contract.
mod iso8601_seconds {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

/// An immutable domain event.
///
/// Constructed once by the business layer and never mutated afterwards.
/// The `name` doubles as the event's type for routing on the broker side
/// (the AMQP `type` message property), so it must be non-empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    name: String,
    version: i32,
    #[serde(with = "iso8601_seconds")]
    occurred_on: DateTime<Utc>,
    props: Map<String, Value>,
}

impl DomainEvent {
    /// Creates an event stamped with the current instant.
    ///
    /// `props` accepts anything that renders to a JSON object; pass
    /// `serde_json::json!({ ... })` or a prebuilt map. Non-object values
    /// are wrapped under a `"value"` key so no data is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Validation`] when `name` is empty.
    pub fn new(name: &str, version: i32, props: Value) -> Result<Self, EventError> {
        Self::at(name, version, Utc::now(), props)
    }

    /// Creates an event with an explicit occurred-on instant.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Validation`] when `name` is empty.
    pub fn at(
        name: &str,
        version: i32,
        occurred_on: DateTime<Utc>,
        props: Value,
    ) -> Result<Self, EventError> {
        assert::not_empty("event name", name)?;
        let props = match props {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Ok(Self {
            name: name.to_string(),
            version,
            occurred_on,
            props,
        })
    }

    /// The event's name, e.g. `"customer.registered"`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event's name in its role as a message type for broker routing.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.name
    }

    /// The schema version of this event.
    #[must_use]
    pub const fn version(&self) -> i32 {
        self.version
    }

    /// The instant this event occurred.
    #[must_use]
    pub const fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    /// The event's property map.
    #[must_use]
    pub const fn props(&self) -> &Map<String, Value> {
        &self.props
    }

    /// Looks up a single property by key.
    #[must_use]
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }
}

impl fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DomainEvent {{ name: {}, version: {}, occurred_on: {} }}",
            self.name,
            self.version,
            self.occurred_on.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

/// Fallible JSON serializer for domain events.
///
/// Stateless; construct it once and share it freely. Both directions are
/// fallible so storage and publication code can surface corrupt bodies as
/// typed errors instead of panicking.
#[derive(Clone, Copy, Debug, Default)]
pub struct EventSerializer;

impl EventSerializer {
    /// Creates a serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Renders `event` to its JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] when the property map cannot
    /// be rendered (rare; non-finite floats are the usual culprit).
    pub fn serialize(&self, event: &DomainEvent) -> Result<String, EventError> {
        serde_json::to_string(event).map_err(|e| EventError::Serialization {
            type_name: event.name().to_string(),
            reason: e.to_string(),
        })
    }

    /// Reads a JSON body back into a [`DomainEvent`].
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] for malformed JSON and
    /// [`EventError::Validation`] when the body carries an empty name.
    pub fn deserialize(&self, body: &str) -> Result<DomainEvent, EventError> {
        let event: DomainEvent =
            serde_json::from_str(body).map_err(|e| EventError::Deserialization(e.to_string()))?;
        assert::not_empty("event name", event.name())?;
        Ok(event)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)] // Test code uses expect for clear failure messages
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn fixed_instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn rejects_empty_name() {
        let result = DomainEvent::new("", 1, json!({}));
        assert!(matches!(result, Err(EventError::Validation(_))));
    }

    #[test]
    fn wire_shape_matches_contract() {
        let event = DomainEvent::at(
            "customer.registered",
            1,
            fixed_instant(),
            json!({ "customer_id": "c-42" }),
        )
        .expect("valid event");

        let serializer = EventSerializer::new();
        let body = serializer.serialize(&event).expect("serializes");
        let value: serde_json::Value = serde_json::from_str(&body).expect("valid json");

        assert_eq!(value["name"], "customer.registered");
        assert_eq!(value["version"], 1);
        assert_eq!(value["occurred_on"], "2026-03-01T09:30:00Z");
        assert_eq!(value["props"]["customer_id"], "c-42");
    }

    #[test]
    fn non_object_props_are_wrapped() {
        let event = DomainEvent::new("ping", 0, json!(42)).expect("valid event");
        assert_eq!(event.prop("value"), Some(&json!(42)));
    }

    #[test]
    fn deserialization_rejects_garbage() {
        let serializer = EventSerializer::new();
        assert!(matches!(
            serializer.deserialize("not json at all"),
            Err(EventError::Deserialization(_))
        ));
    }

    /// Strategy for JSON property values: strings, numbers, bools and one
    /// level of nested maps, mirroring what real events carry.
    fn prop_value() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            "[a-z0-9 ]{0,12}".prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            any::<bool>().prop_map(serde_json::Value::from),
        ];
        prop_oneof![
            leaf.clone(),
            proptest::collection::btree_map("[a-z_]{1,8}", leaf, 0..4).prop_map(|m| {
                serde_json::Value::Object(m.into_iter().collect())
            }),
        ]
    }

    proptest! {
        #[test]
        fn round_trip_preserves_name_instant_and_props(
            name in "[a-z_.]{1,24}",
            version in 0i32..100,
            secs in 0i64..4_102_444_800, // through 2099
            props in proptest::collection::btree_map("[a-z_]{1,8}", prop_value(), 0..6),
        ) {
            let occurred_on = Utc.timestamp_opt(secs, 0).single().expect("valid instant");
            let props = serde_json::Value::Object(props.into_iter().collect());
            let event = DomainEvent::at(&name, version, occurred_on, props).expect("valid event");

            let serializer = EventSerializer::new();
            let body = serializer.serialize(&event).expect("serializes");
            let restored = serializer.deserialize(&body).expect("deserializes");

            prop_assert_eq!(restored.name(), event.name());
            prop_assert_eq!(restored.version(), event.version());
            prop_assert_eq!(
                restored.occurred_on().timestamp(),
                event.occurred_on().timestamp()
            );
            prop_assert_eq!(restored.props(), event.props());
        }
    }
}
