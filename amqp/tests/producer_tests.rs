//! Producer scenarios: durability-contract matching and default routing.

#![allow(clippy::expect_used)] // Test code uses expect for clear failure messages

use eventline_amqp::component::BrokerComponent;
use eventline_amqp::memory::InMemoryBroker;
use eventline_amqp::producer::MessageProducer;
use eventline_amqp::properties::MessageParameters;
use eventline_amqp::settings::ConnectionSettings;
use eventline_core::MessagingError;
use std::sync::Arc;
use std::time::Duration;

fn settings() -> ConnectionSettings {
    ConnectionSettings::for_host("localhost").expect("valid settings")
}

async fn ready_exchange(broker: &InMemoryBroker, durable: bool) -> Arc<BrokerComponent> {
    let exchange = Arc::new(
        BrokerComponent::fanout_exchange(broker.transport(), settings(), "orders", durable)
            .expect("valid exchange"),
    );
    let runner = Arc::clone(&exchange);
    tokio::spawn(async move { runner.run().await });
    exchange
        .wait_until_ready(Duration::from_secs(5))
        .await
        .expect("becomes ready");
    exchange
}

#[tokio::test(start_paused = true)]
async fn durable_component_rejects_transient_message() {
    let broker = InMemoryBroker::new();
    let exchange = ready_exchange(&broker, true).await;
    let _queue = BrokerComponent::subscriber_queue(&exchange, "orders-sub", &[], true, true, false)
        .await
        .expect("bound");
    let producer = MessageProducer::new(exchange);

    let transient = MessageParameters::text_parameters("order.placed", "1", 0);
    let result = producer.send_with(&transient, b"body").await;
    assert!(matches!(
        result,
        Err(MessagingError::DurabilityMismatch {
            message_durable: false,
            component_durable: true,
            ..
        })
    ));
    // The precondition failed before any network call.
    assert_eq!(broker.queue_depth("orders-sub"), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_component_rejects_durable_message() {
    let broker = InMemoryBroker::new();
    let exchange = ready_exchange(&broker, false).await;
    let producer = MessageProducer::new(exchange);

    let durable = MessageParameters::durable_text_parameters("order.placed", "1", 0);
    let result = producer.send_with(&durable, b"body").await;
    assert!(matches!(
        result,
        Err(MessagingError::DurabilityMismatch { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn matching_durability_publishes_through_the_exchange() {
    let broker = InMemoryBroker::new();
    let exchange = ready_exchange(&broker, true).await;
    let _queue = BrokerComponent::subscriber_queue(&exchange, "orders-sub", &[], true, true, false)
        .await
        .expect("bound");
    let producer = MessageProducer::new(exchange);
    assert!(producer.is_ready_for_publish());

    let durable = MessageParameters::durable_text_parameters("order.placed", "1", 0);
    producer.send_with(&durable, b"body").await.expect("publishes");
    assert_eq!(broker.queue_depth("orders-sub"), 1);
}

#[tokio::test(start_paused = true)]
async fn queue_component_routes_through_the_default_exchange() {
    let broker = InMemoryBroker::new();
    let queue = Arc::new(BrokerComponent::durable_queue(
        broker.transport(),
        settings(),
        "work",
    ));
    let runner = Arc::clone(&queue);
    tokio::spawn(async move { runner.run().await });
    queue
        .wait_until_ready(Duration::from_secs(5))
        .await
        .expect("becomes ready");

    let producer = MessageProducer::new(queue);
    producer.send(b"job").await.expect("publishes");
    assert_eq!(broker.queue_depth("work"), 1);
}

#[tokio::test(start_paused = true)]
async fn send_fails_fast_when_not_ready() {
    let broker = InMemoryBroker::new();
    let exchange = Arc::new(
        BrokerComponent::fanout_exchange(broker.transport(), settings(), "orders", true)
            .expect("valid exchange"),
    );
    // run() never started.
    let producer = MessageProducer::new(exchange);
    assert!(!producer.is_ready_for_publish());
    assert!(matches!(
        producer.send(b"body").await,
        Err(MessagingError::NotReady(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn transport_publish_failures_surface_as_typed_errors() {
    let broker = InMemoryBroker::new();
    let exchange = ready_exchange(&broker, true).await;
    let producer = MessageProducer::new(exchange);
    broker.set_fail_publishes(true);

    let durable = MessageParameters::durable_text_parameters("order.placed", "1", 0);
    assert!(matches!(
        producer.send_with(&durable, b"body").await,
        Err(MessagingError::PublishFailed { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn send_to_overrides_the_routing_key() {
    let broker = InMemoryBroker::new();
    let exchange = Arc::new(
        BrokerComponent::direct_exchange(broker.transport(), settings(), "router", true)
            .expect("valid exchange"),
    );
    let runner = Arc::clone(&exchange);
    tokio::spawn(async move { runner.run().await });
    exchange
        .wait_until_ready(Duration::from_secs(5))
        .await
        .expect("becomes ready");

    let _eu = BrokerComponent::subscriber_queue(&exchange, "eu", &["eu"], true, true, false)
        .await
        .expect("bound");
    let _us = BrokerComponent::subscriber_queue(&exchange, "us", &["us"], true, true, false)
        .await
        .expect("bound");
    let producer = MessageProducer::new(exchange);

    let durable = MessageParameters::durable_text_parameters("order.placed", "1", 0);
    producer.send_to("eu", &durable, b"body").await.expect("publishes");
    assert_eq!(broker.queue_depth("eu"), 1);
    assert_eq!(broker.queue_depth("us"), 0);
}
