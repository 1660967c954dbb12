//! # Eventline Outbox
//!
//! The notification publisher: the drain loop of the outbox pattern.
//!
//! Business code appends domain events to the event store inside its own
//! transaction; this crate's [`publisher::NotificationPublisher`] is what
//! a scheduler invokes afterwards (and periodically) to push everything
//! new out to the broker and advance the publication cursor.
//!
//! The publisher is an explicitly constructed, injected object owned by
//! the application's composition root - there is no process-wide
//! singleton and no hidden state beyond the durable cursor itself.

pub mod publisher;

pub use publisher::{NotificationPublisher, PublishError};
