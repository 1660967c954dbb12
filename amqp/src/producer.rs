//! Message producer - publishes through a ready broker component.
//!
//! The producer is channel-ignorant about its target: an exchange
//! component publishes to the exchange with an empty routing key, a queue
//! component publishes to the default exchange with the queue name as the
//! routing key. Either way, when explicit message parameters are supplied
//! their durability must match the component's - a mismatch is a
//! precondition violation reported before any network I/O.

use crate::component::BrokerComponent;
use crate::properties::{DeliveryMode, MessageParameters, MessageProperties};
use eventline_core::{MessagingError, NotificationProducer, PublishableNotification};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Publishes raw messages through a [`BrokerComponent`].
pub struct MessageProducer {
    component: Arc<BrokerComponent>,
}

impl MessageProducer {
    /// Creates a producer over `component`.
    #[must_use]
    pub const fn new(component: Arc<BrokerComponent>) -> Self {
        Self { component }
    }

    /// The component this producer publishes through.
    #[must_use]
    pub const fn component(&self) -> &Arc<BrokerComponent> {
        &self.component
    }

    /// Whether the underlying component is declared and ready.
    #[must_use]
    pub fn is_ready_for_publish(&self) -> bool {
        self.component.is_ready()
    }

    /// Default `text/plain` properties matching the component's
    /// durability; `None` when the component is transient (transient
    /// components send with no explicit properties).
    #[must_use]
    pub fn text_durability(&self) -> Option<MessageProperties> {
        self.component.is_durable().then(|| MessageProperties {
            content_type: Some("text/plain".to_string()),
            delivery_mode: Some(DeliveryMode::Persistent),
            priority: Some(0),
            ..MessageProperties::default()
        })
    }

    /// Default `application/octet-stream` properties matching the
    /// component's durability.
    #[must_use]
    pub fn binary_durability(&self) -> Option<MessageProperties> {
        self.component.is_durable().then(|| MessageProperties {
            content_type: Some("application/octet-stream".to_string()),
            delivery_mode: Some(DeliveryMode::Persistent),
            priority: Some(0),
            ..MessageProperties::default()
        })
    }

    fn default_target(&self) -> (String, String) {
        let exchange = self
            .component
            .exchange_name()
            .unwrap_or_default()
            .to_string();
        let routing_key = self.component.queue_name().unwrap_or_default();
        (exchange, routing_key)
    }

    fn check_durability(&self, parameters: &MessageParameters) -> Result<(), MessagingError> {
        if parameters.is_durable() == self.component.is_durable() {
            Ok(())
        } else {
            Err(MessagingError::DurabilityMismatch {
                component: self.component.name().to_string(),
                message_durable: parameters.is_durable(),
                component_durable: self.component.is_durable(),
            })
        }
    }

    async fn publish(
        &self,
        exchange: String,
        routing_key: String,
        properties: MessageProperties,
        message: &[u8],
    ) -> Result<(), MessagingError> {
        let channel = self.component.channel()?;
        let target = format!("{exchange}/{routing_key}");
        let result = channel
            .publish(exchange, routing_key, properties, message.to_vec())
            .await;
        match &result {
            Ok(()) => {
                metrics::counter!("eventline_messages_published_total").increment(1);
                tracing::debug!(%target, bytes = message.len(), "message published");
            }
            Err(error) => tracing::error!(%target, %error, "publish failed"),
        }
        result
    }

    /// Sends `message` to the component's default target with its default
    /// durability.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NotReady`] when the component has no
    /// channel and [`MessagingError::PublishFailed`] when the transport
    /// refuses the publish.
    pub async fn send(&self, message: &[u8]) -> Result<(), MessagingError> {
        let (exchange, routing_key) = self.default_target();
        let properties = self.text_durability().unwrap_or_default();
        self.publish(exchange, routing_key, properties, message).await
    }

    /// Sends `message` with explicit `parameters`.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::DurabilityMismatch`] before any I/O when
    /// the parameters' durability differs from the component's; otherwise
    /// as [`send`](Self::send).
    pub async fn send_with(
        &self,
        parameters: &MessageParameters,
        message: &[u8],
    ) -> Result<(), MessagingError> {
        self.check_durability(parameters)?;
        let (exchange, routing_key) = self.default_target();
        self.publish(exchange, routing_key, parameters.properties().clone(), message)
            .await
    }

    /// Sends `message` under `routing_key` with explicit `parameters`.
    ///
    /// # Errors
    ///
    /// As [`send_with`](Self::send_with).
    pub async fn send_to(
        &self,
        routing_key: &str,
        parameters: &MessageParameters,
        message: &[u8],
    ) -> Result<(), MessagingError> {
        self.check_durability(parameters)?;
        let exchange = self
            .component
            .exchange_name()
            .unwrap_or_default()
            .to_string();
        self.publish(
            exchange,
            routing_key.to_string(),
            parameters.properties().clone(),
            message,
        )
        .await
    }

    /// Sends `message` to an explicit `exchange` and `routing_key` over
    /// this producer's channel.
    ///
    /// # Errors
    ///
    /// As [`send_with`](Self::send_with).
    pub async fn send_through(
        &self,
        exchange: &str,
        routing_key: &str,
        parameters: &MessageParameters,
        message: &[u8],
    ) -> Result<(), MessagingError> {
        self.check_durability(parameters)?;
        self.publish(
            exchange.to_string(),
            routing_key.to_string(),
            parameters.properties().clone(),
            message,
        )
        .await
    }

    /// Closes the underlying broker component.
    pub async fn close(&self) {
        self.component.close().await;
    }
}

impl NotificationProducer for MessageProducer {
    fn is_ready_for_publish(&self) -> bool {
        self.is_ready_for_publish()
    }

    fn publish(
        &self,
        notification: PublishableNotification,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            let parameters = MessageParameters::durable_text_parameters(
                &notification.type_name,
                &notification.message_id,
                notification.timestamp.timestamp(),
            );
            self.send_with(&parameters, notification.body.as_bytes())
                .await
        })
    }
}
