//! Retrieval strategies
//!
//! This module provides:
//! - [`RetrievalStrategy`] - how a fetch engine pulls one unit of work
//! - [`ImmediateQueueFetch`] - blocking pop across the ready queues
//! - [`ScheduledQueueFetch`] - atomic promotion of due schedule entries
//! - [`select_strategy`] - the one place a strategy is chosen from config

mod immediate;
mod scheduled;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::keys;
use crate::persistence::{QueueStore, StoreError};
use crate::unit_of_work::UnitOfWork;

pub use immediate::ImmediateQueueFetch;
pub use scheduled::{ScheduledEntry, ScheduledQueueFetch};

/// A pluggable way of retrieving work from the store
#[async_trait]
pub trait RetrievalStrategy: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Pause before the next cycle when a retrieval came back empty
    ///
    /// Strategies whose retrieval already blocks for the timeout need no
    /// extra pause.
    fn idle_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Retrieve at most one unit of work
    ///
    /// `Ok(None)` is the expected idle case, not an error.
    async fn retrieve_work(&self) -> Result<Option<UnitOfWork>, StoreError>;

    /// Return unprocessed units to the store
    ///
    /// Failures are logged and not retried.
    async fn bulk_requeue(&self, items: Vec<UnitOfWork>) -> RequeueSummary;
}

/// Result of a requeue pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueSummary {
    /// Store pushes issued, one per distinct queue
    pub pushes: usize,

    /// Units put back
    pub requeued: usize,

    /// Units that could not be put back
    pub failed: usize,
}

/// Push units back onto their plain queues, one push per distinct queue
///
/// Units are grouped by queue name (not raw key) and re-keyed under the
/// store namespace, so items from the same queue cost a single round-trip.
pub(crate) async fn requeue_grouped(
    store: &dyn QueueStore,
    namespace: Option<&str>,
    items: Vec<UnitOfWork>,
) -> RequeueSummary {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for unit in items {
        groups
            .entry(unit.queue_name().to_string())
            .or_default()
            .push(unit.into_payload());
    }

    let mut summary = RequeueSummary::default();
    for (queue, payloads) in groups {
        let key = keys::queue_key(namespace, &queue);
        summary.pushes += 1;
        match store.push(&key, &payloads).await {
            Ok(()) => {
                debug!(queue = %queue, count = payloads.len(), "Requeued units");
                summary.requeued += payloads.len();
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    count = payloads.len(),
                    error = %e,
                    "Failed to requeue units"
                );
                summary.failed += payloads.len();
            }
        }
    }

    summary
}

/// Choose the retrieval strategy for a configuration
///
/// The schedule-polling toggle wins; otherwise an injected override is used,
/// falling back to [`ImmediateQueueFetch`].
pub fn select_strategy(
    config: &FetchConfig,
    store: Arc<dyn QueueStore>,
    override_strategy: Option<Arc<dyn RetrievalStrategy>>,
) -> Arc<dyn RetrievalStrategy> {
    if config.poll_schedule {
        return Arc::new(ScheduledQueueFetch::from_config(config, store));
    }

    match override_strategy {
        Some(strategy) => strategy,
        None => Arc::new(ImmediateQueueFetch::from_config(config, store)),
    }
}
