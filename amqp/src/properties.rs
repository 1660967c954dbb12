//! AMQP basic message properties and the parameter presets producers use.

use chrono::{DateTime, Utc};

/// AMQP delivery mode: whether a message survives a broker restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The message is kept in memory only (delivery mode 1).
    Transient,
    /// The message is written to disk (delivery mode 2).
    Persistent,
}

impl DeliveryMode {
    /// The wire value of this delivery mode.
    #[must_use]
    pub const fn amqp_value(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }
}

/// The subset of AMQP basic properties this pipeline routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME content type of the body.
    pub content_type: Option<String>,
    /// Persistent or transient delivery.
    pub delivery_mode: Option<DeliveryMode>,
    /// Message priority, 0-9.
    pub priority: Option<u8>,
    /// Application correlation id.
    pub correlation_id: Option<String>,
    /// Reply-to address.
    pub reply_to: Option<String>,
    /// Per-message expiration, in milliseconds, as the protocol's string.
    pub expiration: Option<String>,
    /// Application message id; carries the notification id downstream.
    pub message_id: Option<String>,
    /// Message timestamp, epoch seconds.
    pub timestamp: Option<i64>,
    /// Message type; carries the event type name downstream.
    pub type_name: Option<String>,
}

impl MessageProperties {
    /// Whether these properties ask for persistent delivery.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent)
    }

    /// The timestamp as a UTC instant, when present and representable.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }
}

/// A named preset of message properties, the producer-facing face of
/// [`MessageProperties`].
///
/// The presets mirror the two text flavors the pipeline publishes: durable
/// (persistent) notifications from the outbox, and transient text for
/// fire-and-forget signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageParameters {
    properties: MessageProperties,
}

impl MessageParameters {
    /// Wraps explicit properties.
    #[must_use]
    pub const fn new(properties: MessageProperties) -> Self {
        Self { properties }
    }

    /// Persistent `text/plain` parameters carrying the routing triple the
    /// outbox publisher stamps on every notification.
    #[must_use]
    pub fn durable_text_parameters(type_name: &str, message_id: &str, timestamp: i64) -> Self {
        Self::text_flavor(type_name, message_id, timestamp, DeliveryMode::Persistent)
    }

    /// Transient `text/plain` parameters with the same routing triple.
    #[must_use]
    pub fn text_parameters(type_name: &str, message_id: &str, timestamp: i64) -> Self {
        Self::text_flavor(type_name, message_id, timestamp, DeliveryMode::Transient)
    }

    fn text_flavor(
        type_name: &str,
        message_id: &str,
        timestamp: i64,
        delivery_mode: DeliveryMode,
    ) -> Self {
        Self {
            properties: MessageProperties {
                content_type: Some("text/plain".to_string()),
                delivery_mode: Some(delivery_mode),
                priority: Some(0),
                message_id: Some(message_id.to_string()),
                timestamp: Some(timestamp),
                type_name: Some(type_name.to_string()),
                ..MessageProperties::default()
            },
        }
    }

    /// Whether these parameters ask for persistent delivery.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.properties.is_durable()
    }

    /// The wrapped properties.
    #[must_use]
    pub const fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Consumes the parameters, yielding the wrapped properties.
    #[must_use]
    pub fn into_properties(self) -> MessageProperties {
        self.properties
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_wire_values() {
        assert_eq!(DeliveryMode::Transient.amqp_value(), 1);
        assert_eq!(DeliveryMode::Persistent.amqp_value(), 2);
    }

    #[test]
    fn durable_text_parameters_are_persistent() {
        let parameters = MessageParameters::durable_text_parameters("order.placed", "42", 1_700_000_000);
        assert!(parameters.is_durable());
        let properties = parameters.properties();
        assert_eq!(properties.content_type.as_deref(), Some("text/plain"));
        assert_eq!(properties.message_id.as_deref(), Some("42"));
        assert_eq!(properties.type_name.as_deref(), Some("order.placed"));
        assert_eq!(properties.timestamp, Some(1_700_000_000));
    }

    #[test]
    fn text_parameters_are_transient() {
        let parameters = MessageParameters::text_parameters("ping", "1", 0);
        assert!(!parameters.is_durable());
    }
}
