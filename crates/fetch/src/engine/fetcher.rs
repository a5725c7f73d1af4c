//! The fetch cycle for one worker slot
//!
//! Each cycle retrieves at most one unit of work. A retrieved unit is handed
//! to the supervisor, which decides when the slot fetches again. Empty and
//! failed cycles reschedule themselves as a fresh task, so an engine that
//! idles for days still runs at constant stack depth.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use super::assign::WorkAssigner;
use super::signal::FetchSignal;
use crate::config::TIMEOUT;
use crate::persistence::StoreError;
use crate::strategy::RetrievalStrategy;

/// What a single fetch cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A unit was handed to the supervisor
    Assigned {
        /// Outage length, if this cycle ended one
        recovered_after: Option<Duration>,
    },

    /// Nothing to do; another cycle follows after `retry_in`
    Empty {
        retry_in: Duration,
        /// Outage length, if this cycle ended one
        recovered_after: Option<Duration>,
    },

    /// The store failed; the engine paused for the backoff period
    BackedOff {
        /// Whether this failure started a new outage
        newly_down: bool,
    },

    /// Fetching was marked done before the cycle started
    Stopped,

    /// Retrieval was interrupted by teardown
    Terminated,
}

impl CycleOutcome {
    /// Delay before the engine runs its next cycle on its own, if it does
    pub fn next_fetch_in(&self) -> Option<Duration> {
        match self {
            Self::Empty { retry_in, .. } => Some(*retry_in),
            Self::BackedOff { .. } => Some(Duration::ZERO),
            Self::Assigned { .. } | Self::Stopped | Self::Terminated => None,
        }
    }

    /// Outage length reported by this cycle, if it ended one
    pub fn recovered_after(&self) -> Option<Duration> {
        match self {
            Self::Assigned { recovered_after } | Self::Empty { recovered_after, .. } => {
                *recovered_after
            }
            _ => None,
        }
    }
}

/// Drives the fetch-assign-reschedule cycle for one worker slot
///
/// # Example
///
/// ```ignore
/// use corral_fetch::prelude::*;
///
/// let control = FetchControl::new();
/// let (tx, mut rx) = tokio::sync::mpsc::channel(1);
/// let strategy = select_strategy(&config, store, None);
/// let engine = Arc::new(FetchEngine::new(strategy, Arc::new(tx), control.signal()));
///
/// engine.fetch();
/// let unit = rx.recv().await;
/// ```
pub struct FetchEngine {
    id: String,
    strategy: Arc<dyn RetrievalStrategy>,
    assigner: Arc<dyn WorkAssigner>,
    signal: FetchSignal,
    backoff: Duration,
    down_since: Mutex<Option<Instant>>,
}

impl FetchEngine {
    /// Create an engine with the default backoff period
    pub fn new(
        strategy: Arc<dyn RetrievalStrategy>,
        assigner: Arc<dyn WorkAssigner>,
        signal: FetchSignal,
    ) -> Self {
        Self {
            id: "fetcher".to_string(),
            strategy,
            assigner,
            signal,
            backoff: TIMEOUT,
            down_since: Mutex::new(None),
        }
    }

    /// Set the identifier used in logs
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the pause taken after a store failure
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Engine identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The strategy this engine retrieves with
    pub fn strategy(&self) -> &Arc<dyn RetrievalStrategy> {
        &self.strategy
    }

    /// When the current outage started, if the store is considered down
    pub fn down_since(&self) -> Option<Instant> {
        *self.down_since.lock()
    }

    /// Spawn one fetch cycle
    ///
    /// Empty and failed cycles schedule the next cycle as a new task; an
    /// assigned cycle ends the chain until the supervisor calls `fetch`
    /// again. The handle resolves to the first cycle's outcome.
    pub fn fetch(self: &Arc<Self>) -> JoinHandle<CycleOutcome> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = engine.fetch_once().await;
            if let Some(delay) = outcome.next_fetch_in() {
                engine.fetch_after(delay);
            }
            outcome
        })
    }

    fn fetch_after(self: &Arc<Self>, delay: Duration) {
        if delay.is_zero() {
            self.fetch();
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if engine.signal.sleep(delay).await {
                debug!(engine = %engine.id, "Fetching done, not rescheduling");
                return;
            }
            engine.fetch();
        });
    }

    /// Run a single cycle without rescheduling
    #[instrument(skip(self), fields(engine = %self.id, strategy = self.strategy.name()), level = "trace")]
    pub async fn fetch_once(&self) -> CycleOutcome {
        if self.signal.is_done() {
            debug!("Fetching done, skipping cycle");
            return CycleOutcome::Stopped;
        }

        match self.strategy.retrieve_work().await {
            Ok(Some(unit)) => {
                let recovered_after = self.mark_up();
                trace!(queue = %unit.queue_name(), "Assigning unit");

                if let Err(rejected) = self.assigner.assign(unit).await {
                    warn!(
                        queue = %rejected.queue_name(),
                        "Supervisor refused unit, requeueing"
                    );
                    self.strategy.bulk_requeue(vec![rejected]).await;
                }

                CycleOutcome::Assigned { recovered_after }
            }
            Ok(None) => {
                let recovered_after = self.mark_up();
                CycleOutcome::Empty {
                    retry_in: self.strategy.idle_delay(),
                    recovered_after,
                }
            }
            Err(e) if e.is_terminated() || self.signal.is_done() => {
                debug!(error = %e, "Retrieval interrupted by shutdown");
                CycleOutcome::Terminated
            }
            Err(e) => self.back_off(e).await,
        }
    }

    /// Record a failure and pause for the backoff period
    async fn back_off(&self, error: StoreError) -> CycleOutcome {
        let newly_down = {
            let mut down_since = self.down_since.lock();
            if down_since.is_none() {
                *down_since = Some(Instant::now());
                true
            } else {
                false
            }
        };

        if newly_down {
            error!(
                engine = %self.id,
                strategy = self.strategy.name(),
                error = %error,
                details = ?error,
                "Store is down, backing off"
            );
        }

        // Holds this cycle for the full backoff; the next cycle starts right after.
        tokio::time::sleep(self.backoff).await;

        CycleOutcome::BackedOff { newly_down }
    }

    /// Clear the down-state, returning the outage length if there was one
    fn mark_up(&self) -> Option<Duration> {
        let since = self.down_since.lock().take()?;
        let elapsed = since.elapsed();
        info!(
            engine = %self.id,
            elapsed_secs = elapsed.as_secs_f64(),
            "Store recovered after {:.2} seconds",
            elapsed.as_secs_f64()
        );
        Some(elapsed)
    }
}
