//! Event-handling tracker - the consumer-side deduplication primitive.
//!
//! The broker delivers at-least-once, so a consumer may see the same
//! message twice. The tracker is a durable set of already-handled message
//! ids: the exchange listener checks it before dispatching and marks the
//! id only *after* the business handler succeeds ("process, then mark"),
//! which keeps redelivery safe and makes dispatch idempotent.
//!
//! This is the one structure genuinely shared across consumer processes;
//! implementations must support safe concurrent reads and writes.
//!
//! # Retention
//!
//! Nothing here evicts entries implicitly. [`purge_handled_before`] exists
//! so an operator job can align retention with broker message expiry;
//! until it runs, the tracker grows with the message volume.
//!
//! [`purge_handled_before`]: EventHandlingTracker::purge_handled_before

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors raised by event-handling trackers.
#[derive(Error, Debug)]
pub enum HandlingTrackerError {
    /// The backing store failed; the caller should treat the message as
    /// unhandled and retry.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Durable set of already-handled broker message ids.
pub trait EventHandlingTracker: Send + Sync {
    /// Answers whether the message with `message_id` was already handled.
    ///
    /// # Errors
    ///
    /// Returns [`HandlingTrackerError::Storage`] when the lookup fails.
    fn is_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, HandlingTrackerError>> + Send + 'a>>;

    /// Marks `message_id` as handled. Called strictly after the business
    /// handler succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`HandlingTrackerError::Storage`] when the write fails.
    fn mark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>>;

    /// Clears the handled mark for `message_id`, forcing the next delivery
    /// of that id through the business handler again. An operational
    /// repair hook, not part of the normal dispatch path.
    ///
    /// # Errors
    ///
    /// Returns [`HandlingTrackerError::Storage`] when the write fails.
    fn unmark_handled<'a>(
        &'a self,
        message_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlingTrackerError>> + Send + 'a>>;

    /// Deletes entries marked before `cutoff`, returning how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`HandlingTrackerError::Storage`] when the delete fails.
    fn purge_handled_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, HandlingTrackerError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_is_dyn_compatible() {
        fn assert_dyn(_: Option<&dyn EventHandlingTracker>) {}
        assert_dyn(None);
    }
}
