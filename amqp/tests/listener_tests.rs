//! Exchange listener scenarios: idempotent dispatch, shutdown and
//! self-healing.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use eventline_amqp::component::{BrokerState, RECONNECT_DELAY};
use eventline_amqp::listener::{EventDispatcher, ExchangeListener, ListenerConfig};
use eventline_amqp::memory::InMemoryBroker;
use eventline_amqp::producer::MessageProducer;
use eventline_amqp::settings::ConnectionSettings;
use eventline_core::{HandlerError, NotificationProducer, PublishableNotification};
use eventline_testing::mocks::InMemoryEventHandlingTracker;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn settings() -> ConnectionSettings {
    ConnectionSettings::for_host("localhost").expect("valid settings")
}

/// Counts business dispatches; optionally fails the first N of them.
struct CountingDispatcher {
    dispatched: AtomicUsize,
    fail_first: AtomicUsize,
}

impl CountingDispatcher {
    fn new() -> Arc<Self> {
        Self::failing_first(0)
    }

    fn failing_first(count: usize) -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(count),
        })
    }

    fn count(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }
}

impl EventDispatcher for CountingDispatcher {
    fn exchange_name(&self) -> String {
        "order-events".to_string()
    }

    fn queue_name(&self) -> String {
        "order-listener".to_string()
    }

    fn listen_to(&self) -> Vec<String> {
        vec!["order.placed".to_string()]
    }

    fn dispatch<'a>(
        &'a self,
        _message_type: &'a str,
        _message: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlerError::Retryable("not yet".to_string()));
            }
            Ok(())
        })
    }
}

struct ListenerHarness {
    broker: InMemoryBroker,
    listener: Arc<ExchangeListener>,
    dispatcher: Arc<CountingDispatcher>,
    tracker: Arc<InMemoryEventHandlingTracker>,
}

async fn start_listener(dispatcher: Arc<CountingDispatcher>, config: ListenerConfig) -> ListenerHarness {
    eventline_testing::init_test_logging();
    let broker = InMemoryBroker::new();
    let tracker = Arc::new(InMemoryEventHandlingTracker::new());
    let listener = Arc::new(
        ExchangeListener::new(
            broker.transport(),
            settings(),
            Arc::clone(&dispatcher) as Arc<dyn EventDispatcher>,
            Arc::clone(&tracker) as Arc<dyn eventline_core::EventHandlingTracker>,
            config,
        )
        .expect("valid listener"),
    );
    let runner = Arc::clone(&listener);
    tokio::spawn(async move { runner.run().await });
    wait_for_consuming(&listener).await;
    ListenerHarness {
        broker,
        listener,
        dispatcher,
        tracker,
    }
}

async fn wait_for_consuming(listener: &ExchangeListener) {
    for _ in 0..200 {
        if listener.is_ready_for_consume() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(listener.is_ready_for_consume(), "listener never consumed");
}

fn notification(message_id: &str) -> PublishableNotification {
    PublishableNotification {
        type_name: "order.placed".to_string(),
        message_id: message_id.to_string(),
        timestamp: chrono::Utc::now(),
        body: format!(r#"{{ "id": {message_id}, "event": {{}} }}"#),
    }
}

#[tokio::test(start_paused = true)]
async fn duplicate_message_ids_are_dispatched_once() {
    let harness = start_listener(CountingDispatcher::new(), ListenerConfig::default()).await;
    let producer = MessageProducer::new(Arc::clone(harness.listener.exchange()));

    producer.publish(notification("42")).await.expect("publishes");
    producer.publish(notification("42")).await.expect("publishes");

    tokio::time::sleep(Duration::from_millis(100)).await;
    // Second delivery hit the dedup gate: acknowledged, never dispatched.
    assert_eq!(harness.dispatcher.count(), 1);
    assert_eq!(harness.tracker.handled_count(), 1);
    assert_eq!(harness.broker.queue_depth("order-listener"), 0);
    assert_eq!(harness.broker.unacked_count("order-listener"), 0);
    assert_eq!(harness.broker.dropped_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn distinct_message_ids_all_dispatch() {
    let harness = start_listener(CountingDispatcher::new(), ListenerConfig::default()).await;
    let producer = MessageProducer::new(Arc::clone(harness.listener.exchange()));

    for id in ["1", "2", "3"] {
        producer.publish(notification(id)).await.expect("publishes");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.count(), 3);
    assert_eq!(harness.tracker.handled_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_dispatch_is_not_marked_and_retries_fully() {
    let config = ListenerConfig {
        is_retry: true,
        ..ListenerConfig::default()
    };
    // Fail the first business dispatch; the nack requeues and the
    // redelivery runs the full business logic again.
    let harness = start_listener(CountingDispatcher::failing_first(1), config).await;
    let producer = MessageProducer::new(Arc::clone(harness.listener.exchange()));

    producer.publish(notification("7")).await.expect("publishes");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.dispatcher.count(), 2, "process-then-mark retries");
    assert_eq!(harness.tracker.handled_count(), 1);
    assert_eq!(harness.broker.dropped_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unlisted_types_never_reach_the_dispatcher() {
    let harness = start_listener(CountingDispatcher::new(), ListenerConfig::default()).await;
    let producer = MessageProducer::new(Arc::clone(harness.listener.exchange()));

    let mut unwanted = notification("9");
    unwanted.type_name = "order.audited".to_string();
    producer.publish(unwanted).await.expect("publishes");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.count(), 0);
    // Drained, not dropped or requeued.
    assert_eq!(harness.broker.queue_depth("order-listener"), 0);
    assert_eq!(harness.broker.dropped_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_closes_without_reconnecting() {
    let harness = start_listener(CountingDispatcher::new(), ListenerConfig::default()).await;
    let attempts_before = harness.broker.connect_attempts();

    harness.listener.stop().await;
    tokio::time::sleep(RECONNECT_DELAY * 3).await;

    assert_eq!(harness.broker.connect_attempts(), attempts_before);
    assert_eq!(harness.listener.exchange().state(), BrokerState::Closed);
    assert!(!harness.listener.is_ready_for_consume());
}

#[tokio::test(start_paused = true)]
async fn listener_reattaches_after_a_broker_outage() {
    let harness = start_listener(CountingDispatcher::new(), ListenerConfig::default()).await;

    harness.broker.drop_connections("broker restarted");
    tokio::time::sleep(RECONNECT_DELAY * 2).await;
    wait_for_consuming(&harness.listener).await;

    let producer = MessageProducer::new(Arc::clone(harness.listener.exchange()));
    producer.publish(notification("11")).await.expect("publishes");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.dispatcher.count(), 1);
}
