//! # Eventline AMQP
//!
//! AMQP 0-9-1 broker components for the Eventline pipeline: the
//! connection/channel state machine, exchange and queue declaration, the
//! message producer and consumer, and the exchange listener with
//! idempotent dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐    publish     ┌──────────────────────┐
//! │ MessageProducer    ├───────────────►│                      │
//! │  (durable-contract │                │   AMQP broker        │
//! │   matching)        │                │                      │
//! └─────────┬──────────┘                └──────────┬───────────┘
//!           │ channel                              │ deliver
//! ┌─────────▼──────────┐                ┌──────────▼───────────┐
//! │ BrokerComponent    │                │ MessageConsumer      │
//! │  Disconnected →    │                │  prefetch=1,         │
//! │  … → Ready         │                │  ack/nack policy     │
//! │  (reconnect in 5s, │                └──────────┬───────────┘
//! │   not on close())  │                ┌──────────▼───────────┐
//! └─────────┬──────────┘                │ ExchangeListener     │
//!           │                           │  dedup → dispatch →  │
//! ┌─────────▼──────────┐                │  mark handled        │
//! │ Transport seam     │                └──────────────────────┘
//! │  lapin | in-memory │
//! └────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Each owned [`component::BrokerComponent`] is driven by a single
//! `run()` task that owns the connection lifecycle; everything else
//! reaches the channel through `Arc<dyn Channel>` handles. Channels are
//! not safe for concurrent publishing from multiple logical writers -
//! the outbox publisher awaits each publish before issuing the next, and
//! each consumer's dispatch loop is one task processing one message at a
//! time (prefetch 1).
//!
//! # Example
//!
//! ```no_run
//! use eventline_amqp::component::BrokerComponent;
//! use eventline_amqp::lapin_transport::LapinTransport;
//! use eventline_amqp::producer::MessageProducer;
//! use eventline_amqp::settings::ConnectionSettings;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), eventline_core::MessagingError> {
//! let settings = ConnectionSettings::for_host("localhost")?;
//! let exchange = Arc::new(BrokerComponent::fanout_exchange(
//!     LapinTransport::arc(),
//!     settings,
//!     "order-events",
//!     true,
//! )?);
//!
//! let runner = Arc::clone(&exchange);
//! tokio::spawn(async move { runner.run().await });
//! exchange.wait_until_ready(Duration::from_secs(10)).await?;
//!
//! let producer = MessageProducer::new(exchange);
//! producer.send(b"hello").await?;
//! # Ok(())
//! # }
//! ```

pub mod component;
pub mod consumer;
pub mod lapin_transport;
pub mod listener;
pub mod memory;
pub mod producer;
pub mod properties;
pub mod settings;
pub mod transport;

pub use component::{BrokerComponent, BrokerState, RECONNECT_DELAY};
pub use consumer::MessageConsumer;
pub use lapin_transport::LapinTransport;
pub use listener::{EventDispatcher, ExchangeListener, ListenerConfig};
pub use memory::InMemoryBroker;
pub use producer::MessageProducer;
pub use properties::{DeliveryMode, MessageParameters, MessageProperties};
pub use settings::{ConnectionSettings, Credentials};
pub use transport::{Channel, Connection, Delivery, DeliveryStream, ExchangeKind, Transport};
