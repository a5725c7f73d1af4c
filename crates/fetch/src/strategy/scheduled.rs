//! Promotion of due schedule entries into their destination queues

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, instrument};

use super::{requeue_grouped, RequeueSummary, RetrievalStrategy};
use crate::config::FetchConfig;
use crate::keys;
use crate::persistence::{unix_now, QueueStore, StoreError};
use crate::unit_of_work::UnitOfWork;

/// The fields of a schedule entry the fetcher needs to route it
///
/// Everything else in the entry is carried along untouched: the original
/// message string is what gets delivered and re-inserted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduledEntry {
    /// Destination queue name
    pub queue: String,

    /// Re-delivery interval in seconds; absent for one-shot entries
    #[serde(default)]
    pub interval: Option<f64>,
}

impl ScheduledEntry {
    /// Read the routing fields of a raw schedule entry
    pub fn parse(message: &str) -> Result<Self, StoreError> {
        let entry: Self = serde_json::from_str(message)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if entry.queue.is_empty() {
            return Err(StoreError::Serialization("empty queue name".to_string()));
        }
        Ok(entry)
    }

    /// Interval after which the entry is due again, if it recurs
    pub fn recurring_interval(&self) -> Option<f64> {
        self.interval.filter(|i| i.is_finite() && *i > 0.0)
    }
}

/// Polls a schedule set and promotes the lowest due entry
///
/// The due check and removal happen in one atomic store operation, so any
/// number of fetchers can poll the same schedule set without delivering an
/// entry twice. Polling a sorted set does not block, so an empty poll asks
/// the engine to wait one timeout before the next cycle.
pub struct ScheduledQueueFetch {
    store: Arc<dyn QueueStore>,
    namespace: Option<String>,
    schedule_key: String,
    dead_key: String,
    timeout: Duration,
    clock: fn() -> f64,
}

impl ScheduledQueueFetch {
    /// Create a strategy polling `schedule_key`
    pub fn new(
        store: Arc<dyn QueueStore>,
        namespace: Option<String>,
        schedule_key: impl Into<String>,
        dead_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            namespace,
            schedule_key: schedule_key.into(),
            dead_key: dead_key.into(),
            timeout,
            clock: unix_now,
        }
    }

    /// Create a strategy from a fetch configuration
    pub fn from_config(config: &FetchConfig, store: Arc<dyn QueueStore>) -> Self {
        Self::new(
            store,
            config.namespace.clone(),
            config.schedule_key(),
            config.dead_key(),
            config.timeout,
        )
    }

    /// Replace the clock used for due scores
    pub fn with_clock(mut self, clock: fn() -> f64) -> Self {
        self.clock = clock;
        self
    }

    /// The schedule set this strategy polls
    pub fn schedule_key(&self) -> &str {
        &self.schedule_key
    }

    async fn park_malformed(&self, message: &str, now: f64, reason: &StoreError) -> Result<(), StoreError> {
        error!(
            schedule = %self.schedule_key,
            dead_set = %self.dead_key,
            error = %reason,
            payload = %message,
            "Malformed schedule entry, moving to dead set"
        );
        self.store.add_scored(&self.dead_key, now, message).await
    }
}

#[async_trait]
impl RetrievalStrategy for ScheduledQueueFetch {
    fn name(&self) -> &'static str {
        "scheduled"
    }

    fn idle_delay(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self), fields(schedule = %self.schedule_key), level = "trace")]
    async fn retrieve_work(&self) -> Result<Option<UnitOfWork>, StoreError> {
        let now = (self.clock)();
        let Some(message) = self.store.pop_due_below(&self.schedule_key, now).await? else {
            return Ok(None);
        };

        let entry = match ScheduledEntry::parse(&message) {
            Ok(entry) => entry,
            Err(reason) => {
                self.park_malformed(&message, now, &reason).await?;
                return Ok(None);
            }
        };

        if let Some(interval) = entry.recurring_interval() {
            let next_due = now + interval;
            // The entry is already out of the set; a failed re-insert must not
            // also lose the delivery.
            if let Err(e) = self
                .store
                .add_scored(&self.schedule_key, next_due, &message)
                .await
            {
                error!(
                    schedule = %self.schedule_key,
                    queue = %entry.queue,
                    error = %e,
                    payload = %message,
                    "Failed to reschedule recurring entry"
                );
            } else {
                debug!(queue = %entry.queue, next_due, "Rescheduled recurring entry");
            }
        }

        let queue_key = keys::queue_key(self.namespace.as_deref(), &entry.queue);
        Ok(Some(UnitOfWork::new(queue_key, message)))
    }

    /// In-flight scheduled units go straight onto their destination queues;
    /// they were already due, so no delay is reapplied.
    async fn bulk_requeue(&self, items: Vec<UnitOfWork>) -> RequeueSummary {
        requeue_grouped(self.store.as_ref(), self.namespace.as_deref(), items).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryQueueStore;

    const NOW: f64 = 1_000.0;

    fn fixed_now() -> f64 {
        NOW
    }

    fn strategy(store: &Arc<InMemoryQueueStore>) -> ScheduledQueueFetch {
        let store: Arc<dyn QueueStore> = store.clone();
        ScheduledQueueFetch::new(store, None, "schedule", "dead", Duration::from_secs(1))
            .with_clock(fixed_now)
    }

    #[test]
    fn test_parse_entry() {
        let entry = ScheduledEntry::parse(r#"{"queue":"mail","interval":60,"args":[1]}"#).unwrap();
        assert_eq!(entry.queue, "mail");
        assert_eq!(entry.recurring_interval(), Some(60.0));

        let once = ScheduledEntry::parse(r#"{"queue":"mail"}"#).unwrap();
        assert_eq!(once.recurring_interval(), None);

        let zero = ScheduledEntry::parse(r#"{"queue":"mail","interval":0}"#).unwrap();
        assert_eq!(zero.recurring_interval(), None);

        assert!(ScheduledEntry::parse("not json").is_err());
        assert!(ScheduledEntry::parse(r#"{"interval":5}"#).is_err());
        assert!(ScheduledEntry::parse(r#"{"queue":""}"#).is_err());
    }

    #[tokio::test]
    async fn test_promotes_due_entry_to_destination_queue() {
        let store = Arc::new(InMemoryQueueStore::new());
        let message = r#"{"queue":"mail","class":"Digest"}"#;
        store.add_scored("schedule", NOW - 5.0, message).await.unwrap();
        let fetch = strategy(&store);

        let unit = fetch.retrieve_work().await.unwrap().unwrap();

        assert_eq!(unit.queue_key(), "queue:mail");
        assert_eq!(unit.queue_name(), "mail");
        assert_eq!(unit.payload(), message);
        assert!(store.scored_entries("schedule").is_empty());
    }

    #[tokio::test]
    async fn test_never_returns_entry_due_in_future() {
        let store = Arc::new(InMemoryQueueStore::new());
        store
            .add_scored("schedule", NOW + 0.5, r#"{"queue":"later"}"#)
            .await
            .unwrap();
        store
            .add_scored("schedule", NOW, r#"{"queue":"now"}"#)
            .await
            .unwrap();
        let fetch = strategy(&store);

        let unit = fetch.retrieve_work().await.unwrap().unwrap();
        assert_eq!(unit.queue_name(), "now");
        assert!(fetch.retrieve_work().await.unwrap().is_none());
        assert_eq!(store.scored_entries("schedule").len(), 1);
    }

    #[tokio::test]
    async fn test_recurring_entry_is_reinserted_at_now_plus_interval() {
        let store = Arc::new(InMemoryQueueStore::new());
        let message = r#"{"queue":"reports","interval":300}"#;
        store.add_scored("schedule", NOW - 1.0, message).await.unwrap();
        let fetch = strategy(&store);

        let unit = fetch.retrieve_work().await.unwrap().unwrap();

        assert_eq!(unit.payload(), message);
        assert_eq!(
            store.scored_entries("schedule"),
            vec![(message.to_string(), NOW + 300.0)]
        );
    }

    #[tokio::test]
    async fn test_one_shot_entry_is_drained() {
        let store = Arc::new(InMemoryQueueStore::new());
        store
            .add_scored("schedule", NOW - 1.0, r#"{"queue":"once"}"#)
            .await
            .unwrap();
        let fetch = strategy(&store);

        assert!(fetch.retrieve_work().await.unwrap().is_some());
        assert!(store.scored_entries("schedule").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_entry_is_parked_in_dead_set() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.add_scored("schedule", NOW - 1.0, "{broken").await.unwrap();
        let fetch = strategy(&store);

        assert!(fetch.retrieve_work().await.unwrap().is_none());
        assert!(store.scored_entries("schedule").is_empty());
        assert_eq!(
            store.scored_entries("dead"),
            vec![("{broken".to_string(), NOW)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetchers_deliver_single_due_entry_once() {
        for _ in 0..50 {
            let store = Arc::new(InMemoryQueueStore::new());
            store
                .add_scored("schedule", NOW - 1.0, r#"{"queue":"solo"}"#)
                .await
                .unwrap();

            let first = Arc::new(strategy(&store));
            let second = Arc::new(strategy(&store));
            let a = tokio::spawn(async move { first.retrieve_work().await });
            let b = tokio::spawn(async move { second.retrieve_work().await });

            let results = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
            assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_bulk_requeue_targets_plain_queues() {
        let store = Arc::new(InMemoryQueueStore::new());
        let fetch = strategy(&store);
        let items = vec![
            UnitOfWork::new("queue:mail", r#"{"queue":"mail","n":1}"#),
            UnitOfWork::new("queue:mail", r#"{"queue":"mail","n":2}"#),
            UnitOfWork::new("queue:reports", r#"{"queue":"reports"}"#),
        ];

        let summary = fetch.bulk_requeue(items).await;

        assert_eq!(summary.pushes, 2);
        assert_eq!(summary.requeued, 3);
        assert_eq!(store.queue_len("queue:mail"), 2);
        assert_eq!(store.queue_len("queue:reports"), 1);
        assert!(store.scored_entries("schedule").is_empty());
    }
}
