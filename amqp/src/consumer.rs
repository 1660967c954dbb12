//! Message consumer - delivers queue messages to a listener with the
//! pipeline's acknowledgement policy.
//!
//! Before consuming, the consumer sets the channel prefetch to 1, which
//! bounds in-flight unacknowledged messages to one per consumer: strict
//! per-consumer serialization, fair distribution across multiple
//! consumers of the same queue.
//!
//! Dispatch policy per delivery:
//!
//! - message type not in the allowlist → acknowledge immediately without
//!   invoking the listener (drain-and-ignore; an empty allowlist accepts
//!   everything)
//! - listener succeeds → acknowledge
//! - listener fails retryably and this consumer retries → nack with
//!   requeue
//! - any other failure → nack without requeue (dead-letter/drop)
//!
//! Auto-acknowledged mode skips all manual acks and with them the retry
//! distinction.

use crate::component::BrokerComponent;
use crate::transport::{Channel, DeliveryStream};
use eventline_core::{IncomingMessage, MessageListener, MessagingError};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Per-consumer prefetch bound; one unacknowledged message at a time.
const PREFETCH_COUNT: u16 = 1;

static CONSUMER_SEQ: AtomicU64 = AtomicU64::new(0);

fn unpoisoned<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

struct ConsumerShared {
    consuming: AtomicBool,
    closed: AtomicBool,
    ready: AtomicBool,
    tag: Mutex<Option<String>>,
}

/// Consumes one queue, one message at a time.
pub struct MessageConsumer {
    queue: Arc<BrokerComponent>,
    auto_acknowledged: bool,
    is_retry: bool,
    message_types: Mutex<HashSet<String>>,
    shared: Arc<ConsumerShared>,
}

impl MessageConsumer {
    /// Creates a consumer on `queue` and applies the prefetch bound.
    ///
    /// `is_retry` is the consumer's retry policy: when true, retryable
    /// handler failures are requeued; when false, every failure drops the
    /// message.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::InvalidSettings`] when `queue` is not a queue
    ///   component
    /// - [`MessagingError::NotReady`] when the queue has no live channel
    /// - [`MessagingError::ChannelFailed`] when the QoS command fails
    pub async fn new(
        queue: Arc<BrokerComponent>,
        auto_acknowledged: bool,
        is_retry: bool,
    ) -> Result<Self, MessagingError> {
        if !queue.is_queue() {
            return Err(MessagingError::InvalidSettings(
                "consumers attach to queue components".to_string(),
            ));
        }
        let consumer = Self {
            queue,
            auto_acknowledged,
            is_retry,
            message_types: Mutex::new(HashSet::new()),
            shared: Arc::new(ConsumerShared {
                consuming: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                tag: Mutex::new(None),
            }),
        };
        consumer.equalize_message_distribution().await?;
        Ok(consumer)
    }

    /// Applies the prefetch bound so messages distribute evenly across
    /// all consumers of this queue.
    async fn equalize_message_distribution(&self) -> Result<(), MessagingError> {
        let channel = self.queue.channel()?;
        channel.qos(PREFETCH_COUNT).await?;
        self.shared.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            queue = %self.queue.name(),
            prefetch = PREFETCH_COUNT,
            "QoS set"
        );
        Ok(())
    }

    /// Dispatches every message on the queue to `listener`.
    ///
    /// # Errors
    ///
    /// As [`receive_only`](Self::receive_only).
    pub async fn receive_all(
        &self,
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), MessagingError> {
        self.receive_for(listener).await
    }

    /// Dispatches only messages whose type is in `message_types`; other
    /// deliveries are acknowledged and dropped. An empty allowlist
    /// accepts everything.
    ///
    /// # Errors
    ///
    /// - [`MessagingError::NotReady`] when the queue has no live channel
    /// - [`MessagingError::SubscribeFailed`] when the consumer cannot be
    ///   registered or is already consuming
    pub async fn receive_only(
        &self,
        message_types: &[&str],
        listener: Arc<dyn MessageListener>,
    ) -> Result<(), MessagingError> {
        *unpoisoned(self.message_types.lock()) = message_types
            .iter()
            .map(|message_type| (*message_type).to_string())
            .collect();
        self.receive_for(listener).await
    }

    async fn receive_for(&self, listener: Arc<dyn MessageListener>) -> Result<(), MessagingError> {
        let queue_name = self
            .queue
            .queue_name()
            .ok_or_else(|| MessagingError::NotReady(self.queue.name().to_string()))?;
        if self.shared.consuming.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::SubscribeFailed {
                queue: queue_name,
                reason: "already consuming".to_string(),
            });
        }
        let channel = self.queue.channel().inspect_err(|_| {
            self.shared.consuming.store(false, Ordering::SeqCst);
        })?;
        let tag = format!(
            "{queue_name}.{}",
            CONSUMER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let deliveries = channel
            .consume(queue_name.clone(), tag.clone(), self.auto_acknowledged)
            .await
            .inspect_err(|_| {
                self.shared.consuming.store(false, Ordering::SeqCst);
            })?;
        *unpoisoned(self.shared.tag.lock()) = Some(tag);
        tracing::info!(queue = %queue_name, "message listener registered");

        let message_types = unpoisoned(self.message_types.lock()).clone();
        tokio::spawn(dispatch_loop(
            deliveries,
            channel,
            listener,
            message_types,
            self.auto_acknowledged,
            self.is_retry,
            Arc::clone(&self.shared),
        ));
        Ok(())
    }

    /// Whether a listener is registered and the delivery loop is alive.
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.shared.consuming.load(Ordering::SeqCst)
    }

    /// Whether the prefetch bound has been applied.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Whether this consumer lets the broker acknowledge on delivery.
    #[must_use]
    pub const fn is_auto_acknowledged(&self) -> bool {
        self.auto_acknowledged
    }

    /// Whether retryable handler failures requeue.
    #[must_use]
    pub const fn is_retry(&self) -> bool {
        self.is_retry
    }

    /// The message-type allowlist currently in force.
    #[must_use]
    pub fn message_types(&self) -> HashSet<String> {
        unpoisoned(self.message_types.lock()).clone()
    }

    /// The consumer tag, once consuming.
    #[must_use]
    pub fn tag(&self) -> Option<String> {
        unpoisoned(self.shared.tag.lock()).clone()
    }

    /// Cancels the consumer registration and closes its queue component.
    /// Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tag = unpoisoned(self.shared.tag.lock()).take();
        if let Some(tag) = tag {
            if let Ok(channel) = self.queue.channel() {
                if let Err(error) = channel.cancel_consume(tag).await {
                    tracing::debug!(%error, "consumer cancel failed");
                }
            }
        }
        self.queue.close().await;
        self.shared.consuming.store(false, Ordering::SeqCst);
    }
}

async fn dispatch_loop(
    mut deliveries: DeliveryStream,
    channel: Arc<dyn Channel>,
    listener: Arc<dyn MessageListener>,
    message_types: HashSet<String>,
    auto_acknowledged: bool,
    is_retry: bool,
    shared: Arc<ConsumerShared>,
) {
    while let Some(delivery) = deliveries.next().await {
        let delivery_tag = delivery.delivery_tag;
        let type_name = delivery.properties.type_name.clone();
        let is_target = message_types.is_empty()
            || type_name
                .as_deref()
                .is_some_and(|message_type| message_types.contains(message_type));
        if !is_target {
            // Drain-and-ignore: acknowledge so the queue keeps moving,
            // never invoke the listener.
            if !auto_acknowledged {
                if let Err(error) = channel.ack(delivery_tag).await {
                    tracing::warn!(%error, "ack of ignored message failed");
                }
            }
            continue;
        }

        tracing::debug!(message_type = type_name.as_deref().unwrap_or(""), "handling delivery");
        let message = IncomingMessage {
            type_name,
            message_id: delivery.properties.message_id.clone(),
            timestamp: delivery.properties.timestamp_utc(),
            body: delivery.body,
            delivery_tag,
            is_redelivery: delivery.redelivered,
        };
        match listener.handle_message(message).await {
            Ok(()) => {
                metrics::counter!("eventline_messages_handled_total").increment(1);
                if !auto_acknowledged {
                    if let Err(error) = channel.ack(delivery_tag).await {
                        tracing::warn!(%error, "ack failed");
                    }
                }
            }
            Err(error) => {
                let requeue = error.is_retryable() && is_retry;
                metrics::counter!("eventline_messages_failed_total").increment(1);
                tracing::warn!(%error, requeue, "message handling failed");
                if !auto_acknowledged {
                    if let Err(nack_error) = channel.nack(delivery_tag, requeue).await {
                        tracing::warn!(error = %nack_error, "nack failed");
                    }
                }
            }
        }
    }
    shared.consuming.store(false, Ordering::SeqCst);
    tracing::debug!("consumer delivery stream ended");
}
