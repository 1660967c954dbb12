//! In-memory broker for tests and local development.
//!
//! Implements the [`Transport`] seam with real AMQP-ish semantics:
//! exchange routing (direct, fanout, topic), per-consumer prefetch
//! accounting, requeue-on-nack with the redelivered flag, and consumer
//! cleanup with unacked-message requeue when a channel dies. On top of
//! that it offers the failure injection the lifecycle tests need: refuse
//! the next N connects, fail publishes, or drop every live connection as
//! if the broker restarted.
//!
//! Declaration flags (durable, exclusive, auto-delete) are recorded and
//! checked for redeclaration mismatches but not otherwise enforced -
//! nothing restarts in memory.

use crate::properties::MessageProperties;
use crate::settings::ConnectionSettings;
use crate::transport::{
    Channel, CloseReason, Connection, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    QueueSpec, Transport,
};
use eventline_core::MessagingError;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch};

fn unpoisoned<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
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
                return CloseReason("broker dropped".to_string());
            }
        }
    })
}

/// `*` matches one word, `#` matches zero or more words.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(&segment), Some(&word)) if segment == word => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

struct ExchangeRecord {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<BindingRecord>,
}

struct BindingRecord {
    queue: String,
    routing_key: String,
}

struct QueuedMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

struct ConsumerRecord {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    prefetch: u16,
    in_flight: u16,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerRecord {
    fn has_capacity(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < self.prefetch
    }
}

struct QueueRecord {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerRecord>,
    next_consumer: usize,
}

struct UnackedDelivery {
    queue: String,
    consumer_tag: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerCore {
    exchanges: HashMap<String, ExchangeRecord>,
    queues: HashMap<String, QueueRecord>,
    unacked: HashMap<u64, UnackedDelivery>,
    connections: Vec<Weak<MemoryConnection>>,
    connect_attempts: u64,
    fail_next_connects: u32,
    fail_publishes: bool,
    dropped: u64,
    queue_name_counter: u64,
    delivery_tag_counter: u64,
    connection_id_counter: u64,
    channel_id_counter: u64,
}

impl BrokerCore {
    /// Deliver as much as prefetch windows allow, round-robin across the
    /// queue's consumers.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }
            let start = queue.next_consumer % queue.consumers.len();
            let Some(offset) = (0..queue.consumers.len())
                .find(|offset| queue.consumers[(start + offset) % queue.consumers.len()].has_capacity())
            else {
                return;
            };
            let index = (start + offset) % queue.consumers.len();
            queue.next_consumer = index + 1;

            let Some(message) = queue.messages.pop_front() else {
                return;
            };
            self.delivery_tag_counter += 1;
            let tag = self.delivery_tag_counter;
            let delivery = Delivery {
                delivery_tag: tag,
                redelivered: message.redelivered,
                properties: message.properties.clone(),
                body: message.body.clone(),
            };
            let consumer = &mut queue.consumers[index];
            if consumer.sender.send(delivery).is_err() {
                // Receiver went away without a cancel; drop the consumer
                // and put the message back.
                let dead = consumer.tag.clone();
                queue.messages.push_front(message);
                queue.consumers.retain(|consumer| consumer.tag != dead);
                continue;
            }
            if consumer.auto_ack {
                continue;
            }
            consumer.in_flight += 1;
            let consumer_tag = consumer.tag.clone();
            self.unacked.insert(
                tag,
                UnackedDelivery {
                    queue: queue_name.to_string(),
                    consumer_tag,
                    message,
                },
            );
        }
    }

    fn settle(&mut self, delivery_tag: u64, requeue: Option<bool>) -> Result<(), MessagingError> {
        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| MessagingError::AckFailed(format!("unknown delivery tag {delivery_tag}")))?;
        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|consumer| consumer.tag == entry.consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            match requeue {
                Some(true) => {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                }
                Some(false) => self.dropped += 1,
                None => {}
            }
        }
        let queue_name = entry.queue;
        self.pump(&queue_name);
        Ok(())
    }

    /// Removes every consumer registered on `channel_id` and requeues its
    /// unacknowledged deliveries, the way a broker does when a channel
    /// dies.
    fn close_channel(&mut self, channel_id: u64) {
        let mut orphaned: Vec<u64> = Vec::new();
        for (tag, entry) in &self.unacked {
            let on_dying_channel = self.queues.get(&entry.queue).is_some_and(|queue| {
                queue.consumers.iter().any(|consumer| {
                    consumer.tag == entry.consumer_tag && consumer.channel_id == channel_id
                })
            });
            if on_dying_channel {
                orphaned.push(*tag);
            }
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| consumer.channel_id != channel_id);
        }
        let mut touched: Vec<String> = Vec::new();
        for tag in orphaned {
            if let Some(entry) = self.unacked.remove(&tag) {
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.messages.push_front(message);
                    touched.push(entry.queue);
                }
            }
        }
        for queue_name in touched {
            self.pump(&queue_name);
        }
    }
}

/// The in-memory broker.
///
/// Cheap to clone; clones share the same broker state. Hand
/// [`InMemoryBroker::transport`] to the components under test and drive
/// failures through the injection methods.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    core: Arc<Mutex<BrokerCore>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This broker as a [`Transport`] for broker components.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        unpoisoned(self.core.lock()).fail_next_connects = count;
    }

    /// Makes every publish fail (or succeed again) from now on.
    pub fn set_fail_publishes(&self, fail: bool) {
        unpoisoned(self.core.lock()).fail_publishes = fail;
    }

    /// Closes every live connection as if the broker went away.
    pub fn drop_connections(&self, reason: &str) {
        let connections: Vec<Arc<MemoryConnection>> = {
            let mut core = unpoisoned(self.core.lock());
            let live: Vec<Arc<MemoryConnection>> =
                core.connections.iter().filter_map(Weak::upgrade).collect();
            core.connections.clear();
            live
        };
        for connection in connections {
            connection.force_close(CloseReason(reason.to_string()));
        }
    }

    /// How many connection attempts this broker has seen.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        unpoisoned(self.core.lock()).connect_attempts
    }

    /// How many messages are waiting (not in flight) on `queue`.
    #[must_use]
    pub fn queue_depth(&self, queue: &str) -> usize {
        unpoisoned(self.core.lock())
            .queues
            .get(queue)
            .map_or(0, |record| record.messages.len())
    }

    /// How many deliveries are unacknowledged on `queue`.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        unpoisoned(self.core.lock())
            .unacked
            .values()
            .filter(|entry| entry.queue == queue)
            .count()
    }

    /// How many messages have been dropped by nack-without-requeue.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        unpoisoned(self.core.lock()).dropped
    }

    /// Whether an exchange with `name` has been declared.
    #[must_use]
    pub fn exchange_exists(&self, name: &str) -> bool {
        unpoisoned(self.core.lock()).exchanges.contains_key(name)
    }

    /// Whether a queue with `name` has been declared.
    #[must_use]
    pub fn queue_exists(&self, name: &str) -> bool {
        unpoisoned(self.core.lock()).queues.contains_key(name)
    }
}

impl Transport for InMemoryBroker {
    fn connect(
        &self,
        _settings: ConnectionSettings,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Connection>, MessagingError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut core = unpoisoned(self.core.lock());
            core.connect_attempts += 1;
            if core.fail_next_connects > 0 {
                core.fail_next_connects -= 1;
                return Err(MessagingError::ConnectionFailed(
                    "connection refused (injected)".to_string(),
                ));
            }
            core.connection_id_counter += 1;
            let connection = Arc::new(MemoryConnection {
                id: core.connection_id_counter,
                core: Arc::clone(&self.core),
                open: AtomicBool::new(true),
                closed_tx: watch::Sender::new(None),
                channels: Mutex::new(Vec::new()),
            });
            core.connections.push(Arc::downgrade(&connection));
            Ok(connection as Arc<dyn Connection>)
        })
    }
}

/// One in-memory connection.
pub struct MemoryConnection {
    id: u64,
    core: Arc<Mutex<BrokerCore>>,
    open: AtomicBool,
    closed_tx: watch::Sender<Option<CloseReason>>,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryConnection {
    fn force_close(&self, reason: CloseReason) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let channels: Vec<Arc<MemoryChannel>> = unpoisoned(self.channels.lock())
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for channel in channels {
            channel.force_close(reason.clone());
        }
        self.closed_tx.send_replace(Some(reason));
    }
}

impl Connection for MemoryConnection {
    fn open_channel(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Channel>, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            if !self.open.load(Ordering::SeqCst) {
                return Err(MessagingError::ChannelFailed(format!(
                    "connection {} is closed",
                    self.id
                )));
            }
            let channel_id = {
                let mut core = unpoisoned(self.core.lock());
                core.channel_id_counter += 1;
                core.channel_id_counter
            };
            let channel = Arc::new(MemoryChannel {
                id: channel_id,
                core: Arc::clone(&self.core),
                open: AtomicBool::new(true),
                prefetch: AtomicU32::new(0),
                closed_tx: watch::Sender::new(None),
            });
            unpoisoned(self.channels.lock()).push(Arc::downgrade(&channel));
            Ok(channel as Arc<dyn Channel>)
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.force_close(CloseReason("connection closed by client".to_string()));
            Ok(())
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>> {
        closed_future(self.closed_tx.subscribe())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// One in-memory channel.
pub struct MemoryChannel {
    id: u64,
    core: Arc<Mutex<BrokerCore>>,
    open: AtomicBool,
    prefetch: AtomicU32,
    closed_tx: watch::Sender<Option<CloseReason>>,
}

impl MemoryChannel {
    fn force_close(&self, reason: CloseReason) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        unpoisoned(self.core.lock()).close_channel(self.id);
        self.closed_tx.send_replace(Some(reason));
    }

    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MessagingError::ChannelFailed(format!(
                "channel {} is closed",
                self.id
            )))
        }
    }
}

impl Channel for MemoryChannel {
    fn declare_exchange(
        &self,
        spec: ExchangeSpec,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut core = unpoisoned(self.core.lock());
            if let Some(existing) = core.exchanges.get(&spec.name) {
                if existing.kind != spec.kind || existing.durable != spec.durable {
                    return Err(MessagingError::DeclarationFailed {
                        name: spec.name,
                        reason: "redeclared with different parameters".to_string(),
                    });
                }
                return Ok(());
            }
            core.exchanges.insert(
                spec.name,
                ExchangeRecord {
                    kind: spec.kind,
                    durable: spec.durable,
                    bindings: Vec::new(),
                },
            );
            Ok(())
        })
    }

    fn declare_queue(
        &self,
        spec: QueueSpec,
    ) -> Pin<Box<dyn Future<Output = Result<String, MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut core = unpoisoned(self.core.lock());
            let name = if spec.name.is_empty() {
                core.queue_name_counter += 1;
                format!("amq.gen-{}", core.queue_name_counter)
            } else {
                spec.name.clone()
            };
            if let Some(existing) = core.queues.get(&name) {
                if existing.durable != spec.durable
                    || existing.exclusive != spec.exclusive
                    || existing.auto_delete != spec.auto_delete
                {
                    return Err(MessagingError::DeclarationFailed {
                        name,
                        reason: "redeclared with different parameters".to_string(),
                    });
                }
                return Ok(name);
            }
            core.queues.insert(
                name.clone(),
                QueueRecord {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    next_consumer: 0,
                },
            );
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
            self.ensure_open()?;
            let mut core = unpoisoned(self.core.lock());
            if !core.queues.contains_key(&queue) {
                return Err(MessagingError::DeclarationFailed {
                    name: queue,
                    reason: "bind to undeclared queue".to_string(),
                });
            }
            let Some(record) = core.exchanges.get_mut(&exchange) else {
                return Err(MessagingError::DeclarationFailed {
                    name: exchange,
                    reason: "bind to undeclared exchange".to_string(),
                });
            };
            let duplicate = record
                .bindings
                .iter()
                .any(|binding| binding.queue == queue && binding.routing_key == routing_key);
            if !duplicate {
                record.bindings.push(BindingRecord { queue, routing_key });
            }
            Ok(())
        })
    }

    fn qos(
        &self,
        prefetch_count: u16,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.prefetch.store(u32::from(prefetch_count), Ordering::SeqCst);
            Ok(())
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
            self.ensure_open()?;
            let mut core = unpoisoned(self.core.lock());
            if core.fail_publishes {
                return Err(MessagingError::PublishFailed {
                    target: format!("{exchange}/{routing_key}"),
                    reason: "publish failed (injected)".to_string(),
                });
            }
            let targets: Vec<String> = if exchange.is_empty() {
                // Default exchange: route straight to the queue named by
                // the routing key; unroutable messages are dropped.
                if core.queues.contains_key(&routing_key) {
                    vec![routing_key.clone()]
                } else {
                    tracing::debug!(queue = %routing_key, "unroutable message dropped");
                    Vec::new()
                }
            } else {
                let Some(record) = core.exchanges.get(&exchange) else {
                    return Err(MessagingError::PublishFailed {
                        target: format!("{exchange}/{routing_key}"),
                        reason: "no such exchange".to_string(),
                    });
                };
                let mut targets: Vec<String> = record
                    .bindings
                    .iter()
                    .filter(|binding| match record.kind {
                        ExchangeKind::Fanout | ExchangeKind::Headers => true,
                        ExchangeKind::Direct => binding.routing_key == routing_key,
                        ExchangeKind::Topic => topic_matches(&binding.routing_key, &routing_key),
                    })
                    .map(|binding| binding.queue.clone())
                    .collect();
                targets.dedup();
                targets
            };
            for target in targets {
                if let Some(queue) = core.queues.get_mut(&target) {
                    queue.messages.push_back(QueuedMessage {
                        properties: properties.clone(),
                        body: body.clone(),
                        redelivered: false,
                    });
                }
                core.pump(&target);
            }
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
            self.ensure_open()?;
            let prefetch = u16::try_from(self.prefetch.load(Ordering::SeqCst)).unwrap_or(u16::MAX);
            let (sender, mut receiver) = mpsc::unbounded_channel();
            {
                let mut core = unpoisoned(self.core.lock());
                let channel_id = self.id;
                let Some(record) = core.queues.get_mut(&queue) else {
                    return Err(MessagingError::SubscribeFailed {
                        queue,
                        reason: "no such queue".to_string(),
                    });
                };
                record.consumers.push(ConsumerRecord {
                    tag: consumer_tag,
                    channel_id,
                    auto_ack,
                    prefetch,
                    in_flight: 0,
                    sender,
                });
                core.pump(&queue);
            }
            let stream = async_stream::stream! {
                while let Some(delivery) = receiver.recv().await {
                    yield delivery;
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
            self.ensure_open()?;
            unpoisoned(self.core.lock()).settle(delivery_tag, None)
        })
    }

    fn nack(
        &self,
        delivery_tag: u64,
        requeue: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            unpoisoned(self.core.lock()).settle(delivery_tag, Some(requeue))
        })
    }

    fn cancel_consume(
        &self,
        consumer_tag: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut core = unpoisoned(self.core.lock());
            let orphaned: Vec<u64> = core
                .unacked
                .iter()
                .filter(|(_, entry)| entry.consumer_tag == consumer_tag)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in orphaned {
                if let Some(entry) = core.unacked.remove(&tag) {
                    if let Some(queue) = core.queues.get_mut(&entry.queue) {
                        let mut message = entry.message;
                        message.redelivered = true;
                        queue.messages.push_front(message);
                    }
                }
            }
            let mut touched: Vec<String> = Vec::new();
            for (name, queue) in &mut core.queues {
                let before = queue.consumers.len();
                queue.consumers.retain(|consumer| consumer.tag != consumer_tag);
                if queue.consumers.len() != before {
                    touched.push(name.clone());
                }
            }
            for name in touched {
                core.pump(&name);
            }
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), MessagingError>> + Send + '_>> {
        Box::pin(async move {
            self.force_close(CloseReason("channel closed by client".to_string()));
            Ok(())
        })
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = CloseReason> + Send>> {
        closed_future(self.closed_tx.subscribe())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("order.*", "order.placed"));
        assert!(!topic_matches("order.*", "order.placed.eu"));
        assert!(topic_matches("order.#", "order.placed.eu"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("order.#.eu", "order.placed.eu"));
        assert!(!topic_matches("order.placed", "order.cancelled"));
    }
}
