//! Exchange listener - broker wiring plus idempotent dispatch.
//!
//! A listener declares (or attaches to) an exchange, binds a queue to it
//! under its chosen routing keys, and registers a [`MessageConsumer`]
//! restricted to the message types the application cares about. Each
//! delivery then goes through the dedup gate:
//!
//! 1. look the message id up in the [`EventHandlingTracker`];
//! 2. already handled → no-op success (the consumer acks, the business
//!    handler never runs);
//! 3. not handled → run the business dispatch; only on success mark the
//!    id handled.
//!
//! The mark happens strictly *after* success - "process, then mark" -
//! so a crash between the two redelivers and retries the full business
//! logic, never the other way around. That ordering is what turns the
//! broker's at-least-once delivery into exactly-once processing.

use crate::component::{BrokerComponent, BrokerState, RECONNECT_DELAY};
use crate::consumer::MessageConsumer;
use crate::settings::ConnectionSettings;
use crate::transport::{ExchangeKind, Transport};
use eventline_core::{
    EventHandlingTracker, HandlerError, IncomingMessage, MessageListener, MessagingError,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

fn unpoisoned<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// The application side of an exchange listener: where to listen and what
/// to do with each message.
pub trait EventDispatcher: Send + Sync {
    /// The exchange this dispatcher listens to.
    fn exchange_name(&self) -> String;

    /// The queue this dispatcher consumes from.
    fn queue_name(&self) -> String;

    /// The message types this dispatcher handles.
    fn listen_to(&self) -> Vec<String>;

    /// Handles one message body of one of the [`listen_to`] types.
    ///
    /// Errors flow into the consumer's nack path: retryable failures may
    /// requeue, everything else drops the message.
    ///
    /// [`listen_to`]: EventDispatcher::listen_to
    fn dispatch<'a>(
        &'a self,
        message_type: &'a str,
        message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Broker-facing knobs of an [`ExchangeListener`].
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Exchange type to declare. Fanout by default.
    pub exchange_kind: ExchangeKind,
    /// Whether the exchange is durable.
    pub exchange_durable: bool,
    /// Whether the queue is durable.
    pub queue_durable: bool,
    /// Whether the queue is exclusive.
    pub queue_exclusive: bool,
    /// Whether the queue is auto-deleted.
    pub queue_auto_delete: bool,
    /// Routing keys to bind under; defaults to the dispatcher's
    /// [`EventDispatcher::listen_to`] types when `None`.
    pub routing_keys: Option<Vec<String>>,
    /// Let the broker acknowledge on delivery (disables the retry
    /// distinction).
    pub auto_acknowledged: bool,
    /// Whether retryable handler failures requeue.
    pub is_retry: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            exchange_kind: ExchangeKind::Fanout,
            exchange_durable: true,
            queue_durable: true,
            queue_exclusive: true,
            queue_auto_delete: false,
            routing_keys: None,
            auto_acknowledged: false,
            is_retry: false,
        }
    }
}

/// Listens to an exchange and dispatches messages idempotently.
pub struct ExchangeListener {
    dispatcher: Arc<dyn EventDispatcher>,
    tracker: Arc<dyn EventHandlingTracker>,
    config: ListenerConfig,
    exchange: Arc<BrokerComponent>,
    consumer: Mutex<Option<Arc<MessageConsumer>>>,
    stopping: AtomicBool,
}

impl ExchangeListener {
    /// Creates a listener for `dispatcher`, deduplicating through
    /// `tracker`.
    ///
    /// Nothing touches the broker yet; call [`run`](Self::run) to connect
    /// and start consuming.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::InvalidSettings`] when the dispatcher
    /// names an empty exchange.
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        dispatcher: Arc<dyn EventDispatcher>,
        tracker: Arc<dyn EventHandlingTracker>,
        config: ListenerConfig,
    ) -> Result<Self, MessagingError> {
        let exchange = BrokerComponent::exchange(
            transport,
            settings,
            &dispatcher.exchange_name(),
            config.exchange_kind,
            config.exchange_durable,
        )?;
        Ok(Self {
            dispatcher,
            tracker,
            config,
            exchange: Arc::new(exchange),
            consumer: Mutex::new(None),
            stopping: AtomicBool::new(false),
        })
    }

    /// The exchange component this listener drives.
    #[must_use]
    pub const fn exchange(&self) -> &Arc<BrokerComponent> {
        &self.exchange
    }

    /// Whether a consumer is registered and receiving.
    #[must_use]
    pub fn is_ready_for_consume(&self) -> bool {
        unpoisoned(self.consumer.lock())
            .as_ref()
            .is_some_and(|consumer| consumer.is_consuming())
    }

    /// Drives the listener until [`stop`](Self::stop) is called.
    ///
    /// Runs the exchange's connection state machine and, every time the
    /// exchange reaches `Ready`, declares the subscriber queue and
    /// registers the consumer. When the exchange loses its channel the
    /// stale consumer is discarded and a fresh one is attached after the
    /// reconnect, so the listener self-heals along with the connection.
    pub async fn run(&self) {
        let supervisor = async {
            let mut states = self.exchange.watch_state();
            'supervise: loop {
                if self.stopping.load(Ordering::SeqCst) {
                    break;
                }
                // Wait for the exchange to become ready.
                loop {
                    let state = *states.borrow_and_update();
                    match state {
                        BrokerState::Ready => break,
                        BrokerState::Closed => break 'supervise,
                        _ => {
                            if states.changed().await.is_err() {
                                break 'supervise;
                            }
                        }
                    }
                }
                match self.attach().await {
                    Ok(consumer) => {
                        *unpoisoned(self.consumer.lock()) = Some(consumer);
                        tracing::info!(
                            exchange = %self.dispatcher.exchange_name(),
                            queue = %self.dispatcher.queue_name(),
                            "exchange listener consuming"
                        );
                        // Hold until the exchange loses its channel.
                        loop {
                            let state = *states.borrow_and_update();
                            match state {
                                BrokerState::Ready => {
                                    if states.changed().await.is_err() {
                                        break 'supervise;
                                    }
                                }
                                BrokerState::Closed => break 'supervise,
                                _ => break,
                            }
                        }
                        let stale = unpoisoned(self.consumer.lock()).take();
                        if let Some(consumer) = stale {
                            consumer.close().await;
                        }
                        if self.stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!(
                            exchange = %self.dispatcher.exchange_name(),
                            "exchange lost its channel, re-attaching after reconnect"
                        );
                    }
                    Err(error) => {
                        if self.stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!(%error, "listener attach failed, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        };
        tokio::join!(self.exchange.run(), supervisor);
    }

    async fn attach(&self) -> Result<Arc<MessageConsumer>, MessagingError> {
        let listen_to = self.dispatcher.listen_to();
        let routing_keys: Vec<String> = self
            .config
            .routing_keys
            .clone()
            .unwrap_or_else(|| listen_to.clone());
        let routing_key_refs: Vec<&str> =
            routing_keys.iter().map(String::as_str).collect();

        let queue = BrokerComponent::subscriber_queue(
            &self.exchange,
            &self.dispatcher.queue_name(),
            &routing_key_refs,
            self.config.queue_durable,
            self.config.queue_exclusive,
            self.config.queue_auto_delete,
        )
        .await?;

        let consumer = Arc::new(
            MessageConsumer::new(
                Arc::new(queue),
                self.config.auto_acknowledged,
                self.config.is_retry,
            )
            .await?,
        );
        let listen_to_refs: Vec<&str> = listen_to.iter().map(String::as_str).collect();
        consumer
            .receive_only(
                &listen_to_refs,
                Arc::new(IdempotentListener {
                    dispatcher: Arc::clone(&self.dispatcher),
                    tracker: Arc::clone(&self.tracker),
                }),
            )
            .await?;
        Ok(consumer)
    }

    /// Stops consuming and deliberately closes the exchange. Idempotent;
    /// no reconnect follows.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let consumer = unpoisoned(self.consumer.lock()).take();
        if let Some(consumer) = consumer {
            consumer.close().await;
        }
        self.exchange.close().await;
    }
}

/// The dedup gate between the consumer and the business dispatch.
struct IdempotentListener {
    dispatcher: Arc<dyn EventDispatcher>,
    tracker: Arc<dyn EventHandlingTracker>,
}

impl MessageListener for IdempotentListener {
    fn handle_message(
        &self,
        message: IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            let Some(message_id) = message.message_id.clone() else {
                // Without an id there is nothing to deduplicate on;
                // dispatch anyway and accept at-least-once semantics for
                // this message.
                tracing::warn!("message without message_id, dispatching without dedup");
                let text = message
                    .text()
                    .map_err(|_| HandlerError::Rejected("message body is not UTF-8".to_string()))?;
                let message_type = message.type_name.as_deref().unwrap_or_default();
                return self.dispatcher.dispatch(message_type, text).await;
            };

            tracing::debug!(message_id = %message_id, "handling message");
            let handled = self
                .tracker
                .is_handled(&message_id)
                .await
                .map_err(|error| HandlerError::Retryable(error.to_string()))?;
            if handled {
                metrics::counter!("eventline_messages_deduplicated_total").increment(1);
                tracing::debug!(message_id = %message_id, "already handled, skipping");
                return Ok(());
            }

            let text = message
                .text()
                .map_err(|_| HandlerError::Rejected("message body is not UTF-8".to_string()))?;
            let message_type = message.type_name.as_deref().unwrap_or_default();
            self.dispatcher.dispatch(message_type, text).await?;

            // Mark strictly after success; a failure here redelivers and
            // retries the dispatch, which must therefore be idempotent
            // only up to this tracker.
            self.tracker
                .mark_handled(&message_id)
                .await
                .map_err(|error| HandlerError::Retryable(error.to_string()))?;
            Ok(())
        })
    }
}
