//! Unit of work handed from a fetch engine to its supervisor

use serde::{Deserialize, Serialize};

use crate::keys;
use crate::strategy::{RequeueSummary, RetrievalStrategy};

/// One dequeued message and the queue it was taken from
///
/// The payload is never parsed here. A unit is consumed exactly once, either
/// by [`acknowledge`](Self::acknowledge) or by [`requeue`](Self::requeue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    queue_key: String,
    payload: String,
}

impl UnitOfWork {
    /// Create a unit for a message popped from `queue_key`
    pub fn new(queue_key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            queue_key: queue_key.into(),
            payload: payload.into(),
        }
    }

    /// Namespaced store key, e.g. `queue:default`
    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    /// Queue name without the namespace prefix, e.g. `default`
    pub fn queue_name(&self) -> &str {
        keys::queue_name(&self.queue_key)
    }

    /// Raw serialized message
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Consume the unit and return its payload
    pub fn into_payload(self) -> String {
        self.payload
    }

    /// Mark the unit as processed
    ///
    /// Popping already removed the message from the store, so completion
    /// needs no store round-trip.
    pub fn acknowledge(self) {}

    /// Put the unprocessed message back through the strategy that produced it
    pub async fn requeue(self, strategy: &dyn RetrievalStrategy) -> RequeueSummary {
        strategy.bulk_requeue(vec![self]).await
    }
}
