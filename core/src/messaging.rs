//! Messaging ports and errors shared between the outbox publisher and the
//! broker layer.
//!
//! Two seams live here:
//!
//! - [`NotificationProducer`] - what the outbox publisher drains through.
//!   The AMQP `MessageProducer` implements it for production; tests inject
//!   recording or failing doubles to exercise the cursor discipline.
//! - [`MessageListener`] - what a broker consumer hands each delivery to.
//!   The exchange listener wraps application dispatch with deduplication
//!   behind this trait.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::str::Utf8Error;
use thiserror::Error;

/// Errors raised by the broker layer.
///
/// The first two variants are precondition failures and surface before any
/// network I/O; the rest map transport and protocol failures.
#[derive(Error, Debug, Clone)]
pub enum MessagingError {
    /// Connection settings failed validation; nothing was attempted.
    #[error("invalid connection settings: {0}")]
    InvalidSettings(String),

    /// The message's durability does not match the broker component's.
    #[error(
        "message durability (durable: {message_durable}) does not match \
         broker component '{component}' (durable: {component_durable})"
    )]
    DurabilityMismatch {
        /// The component the send was attempted through.
        component: String,
        /// Whether the message properties were durable.
        message_durable: bool,
        /// Whether the component is durable.
        component_durable: bool,
    },

    /// The broker component has not finished declaring, or lost its
    /// channel.
    #[error("broker component '{0}' is not ready")]
    NotReady(String),

    /// Opening the transport connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Opening the logical channel failed.
    #[error("channel failed: {0}")]
    ChannelFailed(String),

    /// Declaring an exchange or queue, or binding a queue, failed.
    #[error("declaration failed for '{name}': {reason}")]
    DeclarationFailed {
        /// The exchange or queue being declared.
        name: String,
        /// The broker's complaint.
        reason: String,
    },

    /// A publish was refused or lost by the transport.
    #[error("publish to '{target}' failed: {reason}")]
    PublishFailed {
        /// `exchange/routing_key` the publish was addressed to.
        target: String,
        /// The underlying failure.
        reason: String,
    },

    /// Registering a consumer on a queue failed.
    #[error("subscription failed for queue '{queue}': {reason}")]
    SubscribeFailed {
        /// The queue being consumed.
        queue: String,
        /// The underlying failure.
        reason: String,
    },

    /// An acknowledgement (ack/nack) could not be sent.
    #[error("acknowledgement failed: {0}")]
    AckFailed(String),

    /// The component was deliberately closed.
    #[error("broker component is closed")]
    Closed,
}

/// A handler's verdict on a delivered message.
///
/// The consumer turns this into the acknowledgement decision: retryable
/// failures are negative-acknowledged with requeue (when the consumer's
/// retry policy allows it), everything else is rejected without requeue.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure; the message may succeed on redelivery.
    #[error("retryable handler failure: {0}")]
    Retryable(String),

    /// Permanent failure; redelivering the message cannot help.
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl HandlerError {
    /// Whether redelivery might succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// One message as delivered to a [`MessageListener`].
///
/// The optional fields mirror the AMQP basic properties: a publisher that
/// set no `type` or `message_id` produces deliveries without them.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// The message type (the AMQP `type` property), if sent.
    pub type_name: Option<String>,
    /// The broker message id (the AMQP `message_id` property), if sent.
    pub message_id: Option<String>,
    /// The message timestamp, if sent.
    pub timestamp: Option<DateTime<Utc>>,
    /// The raw message body.
    pub body: Vec<u8>,
    /// The delivery tag assigned by the broker channel.
    pub delivery_tag: u64,
    /// Whether the broker flagged this delivery as a redelivery.
    pub is_redelivery: bool,
}

impl IncomingMessage {
    /// The body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`Utf8Error`] when the body is not valid
    /// UTF-8.
    pub fn text(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

/// Consumer-side callback invoked once per delivered (and type-filtered)
/// message.
pub trait MessageListener: Send + Sync {
    /// Handles one delivery. Returning `Ok` acknowledges the message;
    /// returning a [`HandlerError`] routes it to the consumer's nack path.
    fn handle_message(
        &self,
        message: IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// A notification rendered and addressed, ready for a producer to publish.
///
/// The routing fields become the AMQP basic properties `type`,
/// `message_id` and `timestamp`; the body is the serialized notification
/// envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishableNotification {
    /// The wrapped event's type name.
    pub type_name: String,
    /// The notification id, stringified for the broker.
    pub message_id: String,
    /// The wrapped event's occurred-on instant.
    pub timestamp: DateTime<Utc>,
    /// The serialized notification envelope.
    pub body: String,
}

/// The seam the outbox publisher drains through.
pub trait NotificationProducer: Send + Sync {
    /// Whether the underlying broker component is declared and ready.
    fn is_ready_for_publish(&self) -> bool;

    /// Publishes one notification as a durable text message.
    ///
    /// # Errors
    ///
    /// Returns a [`MessagingError`] when the publish fails; the caller
    /// must then leave its publication cursor untouched.
    fn publish(
        &self,
        notification: PublishableNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_retry_distinction() {
        assert!(HandlerError::Retryable("db down".to_string()).is_retryable());
        assert!(!HandlerError::Rejected("bad payload".to_string()).is_retryable());
    }

    #[test]
    fn incoming_message_text_decodes_utf8() {
        let message = IncomingMessage {
            type_name: None,
            message_id: None,
            timestamp: None,
            body: b"hello".to_vec(),
            delivery_tag: 1,
            is_redelivery: false,
        };
        assert_eq!(message.text(), Ok("hello"));
    }

    #[test]
    fn ports_are_dyn_compatible() {
        fn assert_producer(_: Option<&dyn NotificationProducer>) {}
        fn assert_listener(_: Option<&dyn MessageListener>) {}
        assert_producer(None);
        assert_listener(None);
    }
}
