//! # Corral Fetch
//!
//! The work-retrieval layer of the corral job broker: pulls units of work
//! off durable queues and hands them to idle worker slots.
//!
//! ## Features
//!
//! - **Fair queue ordering**: strict priority, or weighted-random order reshuffled every cycle
//! - **Scheduled promotion**: due schedule entries move to their queues through one atomic pop
//! - **Outage handling**: fixed backoff, one log line when the store goes down and one when it recovers
//! - **No busy-spinning**: idle cycles either block in the store or wait before rescheduling
//! - **At-least-once shutdown**: unfinished work is grouped per queue and pushed back
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         FetcherPool                         │
//! │  (one engine per slot, runs handlers, restarts the cycle)   │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲ assign(unit)          │ fetch()
//!                 │                       ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         FetchEngine                         │
//! │       (cycle, down-state, backoff, self-rescheduling)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ retrieve_work()
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RetrievalStrategy                      │
//! │          ImmediateQueueFetch | ScheduledQueueFetch          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      QueueStore: InMemoryQueueStore | RedisQueueStore       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use corral_fetch::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryQueueStore::new());
//! store.push("queue:default", &["hello".to_string()]).await.unwrap();
//!
//! let control = FetchControl::new();
//! let (tx, mut rx) = tokio::sync::mpsc::channel(1);
//! let strategy = select_strategy(&FetchConfig::default(), store, None);
//! let engine = Arc::new(FetchEngine::new(strategy, Arc::new(tx), control.signal()));
//!
//! engine.fetch();
//! let unit = rx.recv().await.unwrap();
//! assert_eq!(unit.queue_name(), "default");
//! unit.acknowledge();
//!
//! control.mark_fetching_done();
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod keys;
pub mod persistence;
pub mod pool;
pub mod queue_set;
pub mod strategy;
pub mod unit_of_work;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, FetchConfig, TIMEOUT};
    pub use crate::engine::{CycleOutcome, FetchControl, FetchEngine, FetchSignal, WorkAssigner};
    pub use crate::persistence::{InMemoryQueueStore, QueueStore, StoreError};
    pub use crate::pool::{FetcherPool, FetcherPoolError, FetcherPoolStatus, WorkOutcome};
    pub use crate::queue_set::QueueSet;
    pub use crate::strategy::{
        select_strategy, ImmediateQueueFetch, RequeueSummary, RetrievalStrategy,
        ScheduledQueueFetch,
    };
    pub use crate::unit_of_work::UnitOfWork;
}

// Re-export key types at crate root
pub use config::{ConfigError, FetchConfig, TIMEOUT};
pub use engine::{CycleOutcome, FetchControl, FetchEngine, FetchSignal, WorkAssigner};
#[cfg(feature = "redis")]
pub use persistence::RedisQueueStore;
pub use persistence::{InMemoryQueueStore, QueueStore, StoreError};
pub use pool::{FetcherPool, FetcherPoolError, FetcherPoolStatus, WorkOutcome};
pub use queue_set::QueueSet;
pub use strategy::{
    select_strategy, ImmediateQueueFetch, RequeueSummary, RetrievalStrategy, ScheduledEntry,
    ScheduledQueueFetch,
};
pub use unit_of_work::UnitOfWork;
