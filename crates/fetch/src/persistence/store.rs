//! QueueStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command
    #[error("command error: {0}")]
    Command(String),

    /// A value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store (or the runtime hosting it) is shutting down
    #[error("store is terminated")]
    Terminated,
}

impl StoreError {
    /// Whether this error is the expected noise of a call interrupted by teardown
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// Store holding ready queues and time-ordered schedule sets
///
/// Ready queues are FIFO lists keyed by a namespaced queue key
/// (`queue:default`). Schedule sets are sorted sets of raw messages keyed by
/// a due score in unix seconds. Implementations must be thread-safe: one
/// store is shared by every fetch engine in the process.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Remove and return the head message of the first key holding data
    ///
    /// Keys are checked in the given order. Waits up to `timeout` for a
    /// message to arrive and returns `None` if none does. The returned tuple
    /// is `(queue_key, message)`.
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;

    /// Append messages to the tail of a queue in one operation
    async fn push(&self, key: &str, messages: &[String]) -> Result<(), StoreError>;

    /// Atomically remove and return the lowest-scored entry with score <= `ceiling`
    ///
    /// The check and the removal must be a single server-side step so that
    /// two concurrent callers can never both receive the same entry.
    async fn pop_due_below(&self, key: &str, ceiling: f64) -> Result<Option<String>, StoreError>;

    /// Insert an entry, or update its score if the message is already present
    async fn add_scored(&self, key: &str, score: f64, message: &str) -> Result<(), StoreError>;
}

/// Current wall-clock time as a due score (fractional unix seconds)
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_classification() {
        assert!(StoreError::Terminated.is_terminated());
        assert!(!StoreError::Connection("refused".into()).is_terminated());
        assert!(!StoreError::Command("WRONGTYPE".into()).is_terminated());
    }

    #[test]
    fn test_unix_now_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(unix_now() > 1_577_836_800.0);
    }
}
