//! In-memory implementation of QueueStore for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::store::*;

#[derive(Default)]
struct StoreState {
    queues: HashMap<String, VecDeque<String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

/// In-memory implementation of QueueStore
///
/// Provides the same semantics as the Redis implementation: FIFO lists with
/// a blocking pop that honours its timeout, and sorted sets with unique
/// members whose due-pop runs under a single lock.
///
/// Also carries fault injection for tests: [`set_available`](Self::set_available)
/// simulates an outage and [`close`](Self::close) simulates teardown.
///
/// # Example
///
/// ```
/// use corral_fetch::InMemoryQueueStore;
///
/// let store = InMemoryQueueStore::new();
/// assert_eq!(store.queue_len("queue:default"), 0);
/// ```
pub struct InMemoryQueueStore {
    state: Mutex<StoreState>,
    notify: Notify,
    available: AtomicBool,
    closed: AtomicBool,
    push_calls: AtomicUsize,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            notify: Notify::new(),
            available: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            push_calls: AtomicUsize::new(0),
        }
    }

    /// Toggle simulated availability; while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Simulate teardown: blocked and future calls fail with `Terminated`
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of messages waiting in a queue
    pub fn queue_len(&self, key: &str) -> usize {
        self.state.lock().queues.get(key).map_or(0, VecDeque::len)
    }

    /// Messages in a queue, head first
    pub fn queue_contents(&self, key: &str) -> Vec<String> {
        self.state
            .lock()
            .queues
            .get(key)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries of a sorted set ordered by score
    pub fn scored_entries(&self, key: &str) -> Vec<(String, f64)> {
        let state = self.state.lock();
        let mut entries: Vec<(String, f64)> = state
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        entries
    }

    /// Number of `push` calls served so far
    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Terminated);
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store unavailable".to_string()));
        }
        Ok(())
    }

    fn try_pop(&self, keys: &[String]) -> Option<(String, String)> {
        let mut state = self.state.lock();
        keys.iter().find_map(|key| {
            state
                .queues
                .get_mut(key)
                .and_then(VecDeque::pop_front)
                .map(|message| (key.clone(), message))
        })
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            if let Some(hit) = self.try_pop(keys) {
                return Ok(Some(hit));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn push(&self, key: &str, messages: &[String]) -> Result<(), StoreError> {
        self.check_available()?;
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state
                .queues
                .entry(key.to_string())
                .or_default()
                .extend(messages.iter().cloned());
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn pop_due_below(&self, key: &str, ceiling: f64) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(None);
        };

        let due = set
            .iter()
            .filter(|(_, score)| **score <= ceiling)
            .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(member, _)| member.clone());

        if let Some(member) = &due {
            set.remove(member);
        }
        Ok(due)
    }

    async fn add_scored(&self, key: &str, score: f64, message: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        state
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(message.to_string(), score);
        Ok(())
    }
}
