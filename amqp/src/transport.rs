//! The transport seam between the broker state machine and the wire.
//!
//! [`Transport`], [`Connection`] and [`Channel`] model exactly the AMQP
//! 0-9-1 operations this pipeline needs. Production runs over lapin (see
//! [`crate::lapin_transport`]); tests and local development run over the
//! in-memory broker (see [`crate::memory`]), which is what makes the
//! reconnect, QoS and idempotency properties testable without a broker
//! process.
//!
//! All trait objects are held as `Arc<dyn …>`, so every method takes
//! `&self` and returns a boxed future, mirroring the dyn-compatible trait
//! style of the core ports.

use crate::properties::MessageProperties;
use eventline_core::MessagingError;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// The four AMQP exchange types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on exact routing-key match.
    Direct,
    /// Route to every bound queue, ignoring routing keys.
    Fanout,
    /// Route on dotted-pattern match (`*` one word, `#` zero or more).
    Topic,
    /// Route on message headers.
    Headers,
}

impl ExchangeKind {
    /// The protocol name of this exchange type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

/// Everything needed to declare an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    /// The exchange name.
    pub name: String,
    /// The exchange type.
    pub kind: ExchangeKind,
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
    /// Whether the broker deletes the exchange once unused.
    pub auto_delete: bool,
}

/// Everything needed to declare a queue.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// The queue name; empty asks the broker to generate one.
    pub name: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Whether the queue is exclusive to its declaring connection.
    pub exclusive: bool,
    /// Whether the broker deletes the queue once unused.
    pub auto_delete: bool,
}

/// One message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The channel-scoped delivery tag, used to ack or nack.
    pub delivery_tag: u64,
    /// Whether the broker flagged this as a redelivery.
    pub redelivered: bool,
    /// The message's basic properties.
    pub properties: MessageProperties,
    /// The raw body.
    pub body: Vec<u8>,
}

/// Stream of deliveries from one consumer registration.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Why a connection or channel went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason(pub String);

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opens transport connections.
pub trait Transport: Send + Sync {
    /// Connects to the broker described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ConnectionFailed`] when the transport
    /// connection cannot be established.
    fn connect(
        &self,
        settings: crate::settings::ConnectionSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, MessagingError>> + Send + '_>>;
}

/// One open transport connection.
pub trait Connection: Send + Sync {
    /// Opens a logical channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ChannelFailed`] when the channel cannot
    /// be opened.
    fn open_channel(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Channel>, MessagingError>> + Send + '_>>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ConnectionFailed`] when the close
    /// handshake fails; the connection is unusable either way.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Resolves when the connection goes away, for any reason.
    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>>;

    /// Whether the connection is currently open.
    fn is_open(&self) -> bool;
}

/// One logical channel: the unit all AMQP operations run on.
///
/// Channels are not safe for concurrent publishing from multiple logical
/// writers; callers serialize their use (the outbox publisher awaits each
/// publish, the consumer loop is a single task).
pub trait Channel: Send + Sync {
    /// Declares an exchange.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::DeclarationFailed`] when the broker
    /// refuses the declaration.
    fn declare_exchange(
        &self,
        spec: ExchangeSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Declares a queue, returning its (possibly broker-generated) name.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::DeclarationFailed`] when the broker
    /// refuses the declaration.
    fn declare_queue(
        &self,
        spec: QueueSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String, MessagingError>> + Send + '_>>;

    /// Binds `queue` to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::DeclarationFailed`] when the bind fails.
    fn bind_queue(
        &self,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Sets the per-consumer prefetch count.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ChannelFailed`] when the QoS command is
    /// refused.
    fn qos(
        &self,
        prefetch_count: u16,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Publishes `body` to `exchange` under `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::PublishFailed`] when the transport
    /// refuses or loses the publish.
    fn publish(
        &self,
        exchange: String,
        routing_key: String,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Registers a consumer on `queue`, returning its delivery stream.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::SubscribeFailed`] when the consumer
    /// cannot be registered.
    fn consume(
        &self,
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, MessagingError>> + Send + '_>>;

    /// Acknowledges one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AckFailed`] when the ack cannot be sent.
    fn ack(
        &self,
        delivery_tag: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Negatively acknowledges one delivery, optionally requeueing it.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::AckFailed`] when the nack cannot be
    /// sent.
    fn nack(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Cancels a consumer registration.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::SubscribeFailed`] when the cancel fails.
    fn cancel_consume(
        &self,
        consumer_tag: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Closes the channel.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::ChannelFailed`] when the close handshake
    /// fails; the channel is unusable either way.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>>;

    /// Resolves when the channel goes away, for any reason.
    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>>;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;
}
