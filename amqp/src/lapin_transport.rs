//! Production transport over lapin (AMQP 0-9-1).
//!
//! A thin adapter from the [`Transport`] seam onto the lapin client.
//! Lifecycle notifications come from the connection's error callback;
//! channel-level protocol failures surface through the failed operation
//! itself and, when they take the connection down, through the same
//! callback. Deliberate closes fire the notification explicitly so the
//! component run loop always observes the closure.

use crate::properties::{DeliveryMode, MessageProperties};
use crate::settings::ConnectionSettings;
use crate::transport::{
    Channel, CloseReason, Connection, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    QueueSpec, Transport,
};
use ::lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use ::lapin::types::FieldTable;
use ::lapin::{BasicProperties, ConnectionProperties};
use eventline_core::MessagingError;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::watch;

/// Connects to real brokers over lapin.
#[derive(Clone, Copy, Debug, Default)]
pub struct LapinTransport;

impl LapinTransport {
    /// Creates the transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// The transport as a shareable trait object.
    #[must_use]
    pub fn arc() -> Arc<dyn Transport> {
        Arc::new(Self)
    }
}

impl Transport for LapinTransport {
    fn connect(
        &self,
        settings: ConnectionSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, MessagingError>> + Send + '_>>
    {
        Box::pin(async move {
            let uri = settings.amqp_uri();
            let inner = ::lapin::Connection::connect(&uri, ConnectionProperties::default())
                .await
                .map_err(|error| MessagingError::ConnectionFailed(error.to_string()))?;
            let closed_tx = Arc::new(watch::Sender::new(None));
            {
                let closed_tx = Arc::clone(&closed_tx);
                inner.on_error(move |error| {
                    let _ = closed_tx.send_replace(Some(CloseReason(error.to_string())));
                });
            }
            tracing::info!(host = %settings.host_name(), vhost = %settings.virtual_host(), "AMQP connection open");
            Ok(Arc::new(LapinConnection { inner, closed_tx }) as Arc<dyn Connection>)
        })
    }
}

struct LapinConnection {
    inner: ::lapin::Connection,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

fn closed_future(
    mut receiver: watch::Receiver<Option<CloseReason>>,
) -> Pin<Box<dyn Future<Output = CloseReason> + Send>> {
    Box::pin(async move {
        loop {
            if let Some(reason) = receiver.borrow_and_update().clone() {
                return reason;
            }
            if receiver.changed().await.is_err() {
                return CloseReason("connection dropped".to_string());
            }
        }
    })
}

impl Connection for LapinConnection {
    fn open_channel(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Channel>, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let channel = self
                .inner
                .create_channel()
                .await
                .map_err(|error| MessagingError::ChannelFailed(error.to_string()))?;
            Ok(Arc::new(LapinChannel {
                inner: channel,
                closed_tx: Arc::clone(&self.closed_tx),
            }) as Arc<dyn Channel>)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let result = self
                .inner
                .close(200, "closed by client")
                .await
                .map_err(|error| MessagingError::ConnectionFailed(error.to_string()));
            let _ = self
                .closed_tx
                .send_replace(Some(CloseReason("connection closed by client".to_string())));
            result
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>> {
        closed_future(self.closed_tx.subscribe())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

struct LapinChannel {
    inner: ::lapin::Channel,
    closed_tx: Arc<watch::Sender<Option<CloseReason>>>,
}

const fn to_lapin_exchange_kind(kind: ExchangeKind) -> ::lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => ::lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => ::lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => ::lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => ::lapin::ExchangeKind::Headers,
    }
}

fn to_lapin_properties(properties: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(content_type) = properties.content_type {
        amqp = amqp.with_content_type(content_type.into());
    }
    if let Some(delivery_mode) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(delivery_mode.amqp_value());
    }
    if let Some(priority) = properties.priority {
        amqp = amqp.with_priority(priority);
    }
    if let Some(correlation_id) = properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.into());
    }
    if let Some(expiration) = properties.expiration {
        amqp = amqp.with_expiration(expiration.into());
    }
    if let Some(message_id) = properties.message_id {
        amqp = amqp.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(u64::try_from(timestamp).unwrap_or(0));
    }
    if let Some(type_name) = properties.type_name {
        amqp = amqp.with_kind(type_name.into());
    }
    amqp
}

fn from_lapin_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        delivery_mode: (*properties.delivery_mode()).and_then(|mode| match mode {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }),
        priority: *properties.priority(),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        expiration: properties
            .expiration()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        timestamp: (*properties.timestamp()).and_then(|timestamp| i64::try_from(timestamp).ok()),
        type_name: properties
            .kind()
            .as_ref()
            .map(|value| value.as_str().to_string()),
    }
}

impl Channel for LapinChannel {
    fn declare_exchange(
        &self,
        spec: ExchangeSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .exchange_declare(
                    &spec.name,
                    to_lapin_exchange_kind(spec.kind),
                    ExchangeDeclareOptions {
                        durable: spec.durable,
                        auto_delete: spec.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|error| MessagingError::DeclarationFailed {
                    name: spec.name.clone(),
                    reason: error.to_string(),
                })?;
            tracing::info!(exchange = %spec.name, kind = spec.kind.as_str(), "exchange declared");
            Ok(())
        })
    }

    fn declare_queue(
        &self,
        spec: QueueSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let queue = self
                .inner
                .queue_declare(
                    &spec.name,
                    QueueDeclareOptions {
                        durable: spec.durable,
                        exclusive: spec.exclusive,
                        auto_delete: spec.auto_delete,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|error| MessagingError::DeclarationFailed {
                    name: spec.name.clone(),
                    reason: error.to_string(),
                })?;
            let name = queue.name().as_str().to_string();
            tracing::info!(queue = %name, "queue declared");
            Ok(name)
        })
    }

    fn bind_queue(
        &self,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .queue_bind(
                    &queue,
                    &exchange,
                    &routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|error| MessagingError::DeclarationFailed {
                    name: queue.clone(),
                    reason: error.to_string(),
                })
        })
    }

    fn qos(
        &self,
        prefetch_count: u16,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .basic_qos(prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|error| MessagingError::ChannelFailed(error.to_string()))
        })
    }

    fn publish(
        &self,
        exchange: String,
        routing_key: String,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let target = format!("{exchange}/{routing_key}");
            let confirm = self
                .inner
                .basic_publish(
                    &exchange,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &body,
                    to_lapin_properties(properties),
                )
                .await
                .map_err(|error| MessagingError::PublishFailed {
                    target: target.clone(),
                    reason: error.to_string(),
                })?;
            confirm
                .await
                .map_err(|error| MessagingError::PublishFailed {
                    target,
                    reason: error.to_string(),
                })?;
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: String,
        consumer_tag: String,
        auto_ack: bool,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let mut consumer = self
                .inner
                .basic_consume(
                    &queue,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_ack: auto_ack,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|error| MessagingError::SubscribeFailed {
                    queue: queue.clone(),
                    reason: error.to_string(),
                })?;
            let stream = async_stream::stream! {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            yield Delivery {
                                delivery_tag: delivery.delivery_tag,
                                redelivered: delivery.redelivered,
                                properties: from_lapin_properties(&delivery.properties),
                                body: delivery.data,
                            };
                        }
                        Err(error) => {
                            tracing::error!(%error, "consumer stream error");
                            break;
                        }
                    }
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn ack(
        &self,
        delivery_tag: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
                .map_err(|error| MessagingError::AckFailed(error.to_string()))
        })
    }

    fn nack(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue,
                        ..BasicNackOptions::default()
                    },
                )
                .await
                .map_err(|error| MessagingError::AckFailed(error.to_string()))
        })
    }

    fn cancel_consume(
        &self,
        consumer_tag: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
                .map_err(|error| MessagingError::SubscribeFailed {
                    queue: String::new(),
                    reason: error.to_string(),
                })
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.inner
                .close(200, "closed by client")
                .await
                .map_err(|error| MessagingError::ChannelFailed(error.to_string()))
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>> {
        // Channel lifecycle rides on the connection's notification; a
        // protocol error that kills only the channel surfaces through the
        // failing operation first.
        closed_future(self.closed_tx.subscribe())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}
