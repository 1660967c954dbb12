//! # Eventline Core
//!
//! Core types and port traits for the Eventline reliable event-publication
//! pipeline.
//!
//! Domain events recorded inside a business transaction are appended to an
//! append-only event store, later drained and published to an AMQP broker
//! with at-least-once semantics, and dispatched exactly-once at the
//! application level on the consumer side by deduplicating on message id.
//!
//! ```text
//! ┌──────────────────┐
//! │ Business         │
//! │ transaction      │
//! └────────┬─────────┘
//!          │ append
//!          ▼
//! ┌──────────────────┐      ┌────────────────────────┐
//! │  Event Store     │◄─────┤ Published-Notification │
//! │  (append-only)   │ read │ Tracker (cursor)       │
//! └────────┬─────────┘      └───────────▲────────────┘
//!          │ drain since cursor         │ advance after
//!          ▼                            │ full batch
//! ┌──────────────────┐                  │
//! │ Notification     ├──────────────────┘
//! │ Publisher        │
//! └────────┬─────────┘
//!          │ publish (at-least-once)
//!          ▼
//! ┌──────────────────┐      ┌────────────────────────┐
//! │ AMQP broker      ├─────►│ Exchange Listener      │
//! └──────────────────┘      │ + Event-Handling       │
//!                           │   Tracker (dedup)      │
//!                           └────────────────────────┘
//! ```
//!
//! # Crate layout
//!
//! This crate holds the pure types and the port traits; the sibling crates
//! provide the implementations:
//!
//! - `eventline-amqp` - broker component state machine, producer, consumer,
//!   exchange listener
//! - `eventline-postgres` - sqlx-backed stores and trackers
//! - `eventline-outbox` - the notification publisher (outbox drain loop)
//! - `eventline-testing` - in-memory doubles for all the ports
//!
//! # Key invariants
//!
//! - Stored-event ids are strictly increasing in append order;
//!   `all_stored_events_since(n)` returns exactly the events with id > n,
//!   ascending.
//! - A publication cursor never regresses and only advances to the id of
//!   the last notification of a fully published batch.
//! - A [`notification::Notification`]'s id always equals the id of the
//!   stored event it was derived from.
//!
//! # Dyn compatibility
//!
//! The port traits use explicit `Pin<Box<dyn Future>>` returns instead of
//! `async fn` so they can be held as `Arc<dyn EventStore>` and friends by
//! the publisher and listener.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod assert;
pub mod event;
pub mod event_store;
pub mod handling;
pub mod messaging;
pub mod notification;
pub mod stored_event;
pub mod tracker;

pub use assert::AssertionError;
pub use event::{DomainEvent, EventError, EventSerializer};
pub use event_store::{EventStore, EventStoreError};
pub use handling::{EventHandlingTracker, HandlingTrackerError};
pub use messaging::{
    HandlerError, IncomingMessage, MessageListener, MessagingError, NotificationProducer,
    PublishableNotification,
};
pub use notification::{Notification, NotificationReader, NotificationSerializer};
pub use stored_event::StoredEvent;
pub use tracker::{PublishedNotificationTracker, PublishedNotificationTrackerStore, TrackerError};
