//! # Eventline Testing
//!
//! Testing utilities for the Eventline pipeline: in-memory
//! implementations of every core port, producers with scriptable
//! failures, and a log initializer for tests.
//!
//! ## Example
//!
//! ```
//! use eventline_core::{DomainEvent, EventStore};
//! use eventline_testing::mocks::InMemoryEventStore;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryEventStore::new();
//! let event = DomainEvent::new("order.placed", 1, json!({ "order_id": "o-1" }))?;
//! let stored = store.append(event).await?;
//! assert_eq!(stored.id(), 1);
//! # Ok(())
//! # }
//! ```

pub mod mocks;

pub use mocks::{
    FlakyProducer, InMemoryEventHandlingTracker, InMemoryEventStore,
    InMemoryPublishedNotificationTrackerStore, RecordingProducer,
};

/// Initializes `tracing` for a test binary, once, honoring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs the
/// subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
