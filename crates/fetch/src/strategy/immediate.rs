//! Blocking pop across the ready queues

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{instrument, trace};

use super::{requeue_grouped, RequeueSummary, RetrievalStrategy};
use crate::config::FetchConfig;
use crate::keys;
use crate::persistence::{QueueStore, StoreError};
use crate::queue_set::QueueSet;
use crate::unit_of_work::UnitOfWork;

/// Pops one message from whichever ready queue yields first
///
/// Each retrieval orders the queue keys per the [`QueueSet`] policy and
/// issues a single blocking pop across all of them, bounded by the timeout.
pub struct ImmediateQueueFetch {
    store: Arc<dyn QueueStore>,
    queues: QueueSet,
    namespace: Option<String>,
    timeout: Duration,
}

impl ImmediateQueueFetch {
    /// Create a strategy over the given queue set
    pub fn new(
        store: Arc<dyn QueueStore>,
        queues: QueueSet,
        namespace: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            queues,
            namespace,
            timeout,
        }
    }

    /// Create a strategy from a fetch configuration
    pub fn from_config(config: &FetchConfig, store: Arc<dyn QueueStore>) -> Self {
        Self::new(
            store,
            config.queue_set(),
            config.namespace.clone(),
            config.timeout,
        )
    }

    /// Queue keys in the order they are checked this cycle
    pub fn queue_keys(&self) -> Vec<String> {
        self.queues
            .ordered_names()
            .iter()
            .map(|name| keys::queue_key(self.namespace.as_deref(), name))
            .collect()
    }
}

#[async_trait]
impl RetrievalStrategy for ImmediateQueueFetch {
    fn name(&self) -> &'static str {
        "immediate"
    }

    #[instrument(skip(self), level = "trace")]
    async fn retrieve_work(&self) -> Result<Option<UnitOfWork>, StoreError> {
        let keys = self.queue_keys();
        let popped = self.store.blocking_pop(&keys, self.timeout).await?;

        Ok(popped.map(|(queue_key, payload)| {
            trace!(queue_key = %queue_key, "Popped message");
            UnitOfWork::new(queue_key, payload)
        }))
    }

    async fn bulk_requeue(&self, items: Vec<UnitOfWork>) -> RequeueSummary {
        requeue_grouped(self.store.as_ref(), self.namespace.as_deref(), items).await
    }
}
