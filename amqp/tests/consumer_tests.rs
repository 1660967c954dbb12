//! Consumer scenarios: the prefetch bound, type filtering and the
//! ack/nack policy.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use eventline_amqp::component::BrokerComponent;
use eventline_amqp::memory::InMemoryBroker;
use eventline_amqp::consumer::MessageConsumer;
use eventline_amqp::producer::MessageProducer;
use eventline_amqp::properties::MessageParameters;
use eventline_amqp::settings::ConnectionSettings;
use eventline_core::{HandlerError, IncomingMessage, MessageListener};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

fn settings() -> ConnectionSettings {
    ConnectionSettings::for_host("localhost").expect("valid settings")
}

async fn ready_queue(broker: &InMemoryBroker, name: &str) -> Arc<BrokerComponent> {
    let queue = Arc::new(BrokerComponent::durable_queue(
        broker.transport(),
        settings(),
        name,
    ));
    let runner = Arc::clone(&queue);
    tokio::spawn(async move { runner.run().await });
    queue
        .wait_until_ready(Duration::from_secs(5))
        .await
        .expect("becomes ready");
    queue
}

/// Counts invocations and holds each one until a permit is released.
struct GatedListener {
    started: AtomicUsize,
    finished: AtomicUsize,
    gate: Arc<Semaphore>,
}

impl GatedListener {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            gate: Arc::new(Semaphore::new(0)),
        })
    }
}

impl MessageListener for GatedListener {
    fn handle_message(
        &self,
        _message: IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| HandlerError::Retryable("gate closed".to_string()))?;
            permit.forget();
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Records message types and fails per a script of verdicts.
struct ScriptedListener {
    seen: std::sync::Mutex<Vec<(Option<String>, bool)>>,
    verdicts: std::sync::Mutex<Vec<Result<(), HandlerError>>>,
}

impl ScriptedListener {
    fn new(verdicts: Vec<Result<(), HandlerError>>) -> Arc<Self> {
        Arc::new(Self {
            seen: std::sync::Mutex::new(Vec::new()),
            verdicts: std::sync::Mutex::new(verdicts),
        })
    }

    fn seen(&self) -> Vec<(Option<String>, bool)> {
        self.seen.lock().expect("lock").clone()
    }
}

impl MessageListener for ScriptedListener {
    fn handle_message(
        &self,
        message: IncomingMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.seen
                .lock()
                .expect("lock")
                .push((message.type_name.clone(), message.is_redelivery));
            let mut verdicts = self.verdicts.lock().expect("lock");
            if verdicts.is_empty() {
                Ok(())
            } else {
                verdicts.remove(0)
            }
        })
    }
}

fn durable_text(type_name: &str, message_id: &str) -> MessageParameters {
    MessageParameters::durable_text_parameters(type_name, message_id, 1_700_000_000)
}

#[tokio::test(start_paused = true)]
async fn prefetch_bounds_in_flight_messages_to_one() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    for index in 0..3 {
        producer
            .send_with(&durable_text("job", &index.to_string()), b"payload")
            .await
            .expect("publishes");
    }
    assert_eq!(broker.queue_depth("work"), 3);

    let consumer = MessageConsumer::new(Arc::clone(&queue), false, false)
        .await
        .expect("applies qos");
    assert!(consumer.is_ready());
    let listener = GatedListener::new();
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    // Only one delivery may be in flight until it is acked.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.started.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count("work"), 1);
    assert_eq!(broker.queue_depth("work"), 2);

    // Release the first handler; the ack lets the second through.
    listener.gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.finished.load(Ordering::SeqCst), 1);
    assert_eq!(listener.started.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked_count("work"), 1);

    listener.gate.add_permits(2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.finished.load(Ordering::SeqCst), 3);
    assert_eq!(broker.queue_depth("work"), 0);
    assert_eq!(broker.unacked_count("work"), 0);
}

#[tokio::test(start_paused = true)]
async fn filtered_types_are_acked_without_dispatch() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    producer
        .send_with(&durable_text("order.placed", "1"), b"wanted")
        .await
        .expect("publishes");
    producer
        .send_with(&durable_text("order.audited", "2"), b"unwanted")
        .await
        .expect("publishes");
    producer
        .send_with(&durable_text("order.placed", "3"), b"wanted")
        .await
        .expect("publishes");

    let consumer = MessageConsumer::new(Arc::clone(&queue), false, false)
        .await
        .expect("applies qos");
    let listener = ScriptedListener::new(Vec::new());
    consumer
        .receive_only(
            &["order.placed"],
            Arc::clone(&listener) as Arc<dyn MessageListener>,
        )
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = listener.seen();
    assert_eq!(seen.len(), 2, "only allowlisted types dispatched: {seen:?}");
    assert!(seen.iter().all(|(t, _)| t.as_deref() == Some("order.placed")));
    // The filtered message was acknowledged, not dropped or requeued.
    assert_eq!(broker.queue_depth("work"), 0);
    assert_eq!(broker.unacked_count("work"), 0);
    assert_eq!(broker.dropped_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_allowlist_accepts_everything() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    producer
        .send_with(&durable_text("a", "1"), b"x")
        .await
        .expect("publishes");
    producer
        .send_with(&durable_text("b", "2"), b"y")
        .await
        .expect("publishes");

    let consumer = MessageConsumer::new(Arc::clone(&queue), false, false)
        .await
        .expect("applies qos");
    let listener = ScriptedListener::new(Vec::new());
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.seen().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_requeues_and_redelivers() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    producer
        .send_with(&durable_text("job", "1"), b"payload")
        .await
        .expect("publishes");

    // First attempt fails retryably, second succeeds; is_retry = true.
    let listener = ScriptedListener::new(vec![
        Err(HandlerError::Retryable("db briefly down".to_string())),
        Ok(()),
    ]);
    let consumer = MessageConsumer::new(Arc::clone(&queue), false, true)
        .await
        .expect("applies qos");
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = listener.seen();
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].1, "first delivery is not a redelivery");
    assert!(seen[1].1, "second delivery is flagged redelivered");
    assert_eq!(broker.dropped_count(), 0);
    assert_eq!(broker.queue_depth("work"), 0);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failure_drops_the_message() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    producer
        .send_with(&durable_text("job", "1"), b"payload")
        .await
        .expect("publishes");

    let listener = ScriptedListener::new(vec![Err(HandlerError::Rejected(
        "malformed payload".to_string(),
    ))]);
    let consumer = MessageConsumer::new(Arc::clone(&queue), false, true)
        .await
        .expect("applies qos");
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.seen().len(), 1);
    assert_eq!(broker.dropped_count(), 1);
    assert_eq!(broker.queue_depth("work"), 0);
}

#[tokio::test(start_paused = true)]
async fn retryable_failure_without_retry_policy_drops() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    producer
        .send_with(&durable_text("job", "1"), b"payload")
        .await
        .expect("publishes");

    // is_retry = false: even a retryable failure is not requeued.
    let listener = ScriptedListener::new(vec![Err(HandlerError::Retryable(
        "transient".to_string(),
    ))]);
    let consumer = MessageConsumer::new(Arc::clone(&queue), false, false)
        .await
        .expect("applies qos");
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.seen().len(), 1);
    assert_eq!(broker.dropped_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn auto_acknowledged_mode_disables_the_retry_distinction() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let producer = MessageProducer::new(Arc::clone(&queue));
    for index in 0..3 {
        producer
            .send_with(&durable_text("job", &index.to_string()), b"payload")
            .await
            .expect("publishes");
    }

    // Handler failures change nothing: the broker already considers the
    // messages settled on delivery.
    let listener = ScriptedListener::new(vec![
        Err(HandlerError::Retryable("transient".to_string())),
        Err(HandlerError::Rejected("permanent".to_string())),
        Ok(()),
    ]);
    let consumer = MessageConsumer::new(Arc::clone(&queue), true, true)
        .await
        .expect("applies qos");
    assert!(consumer.is_auto_acknowledged());
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.seen().len(), 3);
    assert_eq!(broker.queue_depth("work"), 0);
    assert_eq!(broker.unacked_count("work"), 0);
    assert_eq!(broker.dropped_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn consumer_registers_only_once() {
    let broker = InMemoryBroker::new();
    let queue = ready_queue(&broker, "work").await;
    let consumer = MessageConsumer::new(Arc::clone(&queue), false, false)
        .await
        .expect("applies qos");
    let listener = ScriptedListener::new(Vec::new());
    consumer
        .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
        .await
        .expect("consumes");
    assert!(consumer.is_consuming());
    assert!(
        consumer
            .receive_all(Arc::clone(&listener) as Arc<dyn MessageListener>)
            .await
            .is_err()
    );
}
