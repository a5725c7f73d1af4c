//! Fetcher pool
//!
//! Supervises one fetch engine per worker slot, runs a handler for every
//! assigned unit, and restarts the slot's fetch cycle once the handler is
//! done. Shutdown stops new cycles and puts unfinished work back.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::FetchConfig;
use crate::engine::{FetchControl, FetchEngine, FetchSignal, WorkAssigner};
use crate::persistence::QueueStore;
use crate::strategy::{select_strategy, RetrievalStrategy};
use crate::unit_of_work::UnitOfWork;

/// What the handler decided about a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The unit was processed
    Acknowledge,
    /// The unit should go back to the store unprocessed
    Requeue,
}

/// Handler function type
pub type WorkHandler = Arc<
    dyn Fn(UnitOfWork) -> Pin<Box<dyn Future<Output = WorkOutcome> + Send>> + Send + Sync,
>;

/// Fetcher pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherPoolStatus {
    /// Engines are being created
    Starting,
    /// Engines are fetching
    Running,
    /// Fetching is done; waiting for in-flight work
    Draining,
    /// Everything has stopped
    Stopped,
}

/// Fetcher pool errors
#[derive(Debug, thiserror::Error)]
pub enum FetcherPoolError {
    /// Pool already running
    #[error("fetcher pool is already running")]
    AlreadyRunning,

    /// Pool not running
    #[error("fetcher pool is not running")]
    NotRunning,

    /// Pools are single-use; a shut down pool cannot start again
    #[error("fetcher pool has already been shut down")]
    Finished,

    /// In-flight work outlived the shutdown timeout and was requeued
    #[error("graceful shutdown timed out, {requeued} unit(s) requeued")]
    ShutdownTimeout { requeued: usize },
}

struct InFlight {
    unit: UnitOfWork,
    abort: AbortHandle,
}

type InFlightMap = Arc<Mutex<HashMap<usize, InFlight>>>;

/// Routes a slot's units to the dispatcher
struct SlotAssigner {
    slot: usize,
    tx: mpsc::UnboundedSender<(usize, UnitOfWork)>,
}

#[async_trait]
impl WorkAssigner for SlotAssigner {
    async fn assign(&self, unit: UnitOfWork) -> Result<(), UnitOfWork> {
        self.tx
            .send((self.slot, unit))
            .map_err(|rejected| rejected.0 .1)
    }
}

/// Pool of fetch engines, one per worker slot
///
/// # Example
///
/// ```ignore
/// use corral_fetch::prelude::*;
///
/// let config = FetchConfig::from_env()?;
/// let pool = FetcherPool::from_store(store, config);
///
/// pool.start(|unit| async move {
///     println!("{}", unit.payload());
///     WorkOutcome::Acknowledge
/// })?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct FetcherPool {
    id: String,
    strategy: Arc<dyn RetrievalStrategy>,
    config: FetchConfig,
    control: FetchControl,
    status: RwLock<FetcherPoolStatus>,
    in_flight: InFlightMap,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl FetcherPool {
    /// Create a pool retrieving with the given strategy
    pub fn new(strategy: Arc<dyn RetrievalStrategy>, config: FetchConfig) -> Self {
        Self {
            id: format!("fetcher-{}", Uuid::now_v7()),
            strategy,
            config,
            control: FetchControl::new(),
            status: RwLock::new(FetcherPoolStatus::Stopped),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            dispatch_handle: Mutex::new(None),
        }
    }

    /// Create a pool with the strategy the configuration selects
    pub fn from_store(store: Arc<dyn QueueStore>, config: FetchConfig) -> Self {
        let strategy = select_strategy(&config, store, None);
        Self::new(strategy, config)
    }

    /// Pool identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status
    pub fn status(&self) -> FetcherPoolStatus {
        *self.status.read()
    }

    /// Number of units being handled right now
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// A shutdown signal tied to this pool
    pub fn signal(&self) -> FetchSignal {
        self.control.signal()
    }

    /// Spawn the engines and the dispatcher
    #[instrument(skip(self, handler), fields(pool_id = %self.id))]
    pub fn start<F, Fut>(&self, handler: F) -> Result<(), FetcherPoolError>
    where
        F: Fn(UnitOfWork) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkOutcome> + Send + 'static,
    {
        {
            let mut status = self.status.write();
            if *status != FetcherPoolStatus::Stopped {
                return Err(FetcherPoolError::AlreadyRunning);
            }
            if self.control.is_done() {
                return Err(FetcherPoolError::Finished);
            }
            *status = FetcherPoolStatus::Starting;
        }

        info!(
            pool_id = %self.id,
            strategy = self.strategy.name(),
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "Starting fetcher pool"
        );

        let handler: WorkHandler = Arc::new(move |unit| Box::pin(handler(unit)));
        let (tx, rx) = mpsc::unbounded_channel();

        let engines: Vec<Arc<FetchEngine>> = (0..self.config.concurrency.max(1))
            .map(|slot| {
                let assigner = SlotAssigner {
                    slot,
                    tx: tx.clone(),
                };
                Arc::new(
                    FetchEngine::new(
                        Arc::clone(&self.strategy),
                        Arc::new(assigner),
                        self.control.signal(),
                    )
                    .with_id(format!("{}-{}", self.id, slot))
                    .with_backoff(self.config.timeout),
                )
            })
            .collect();
        drop(tx);

        for engine in &engines {
            engine.fetch();
        }

        let dispatcher = Dispatcher {
            engines,
            handler,
            strategy: Arc::clone(&self.strategy),
            in_flight: Arc::clone(&self.in_flight),
            signal: self.control.signal(),
        };
        *self.dispatch_handle.lock() = Some(tokio::spawn(dispatcher.run(rx)));

        *self.status.write() = FetcherPoolStatus::Running;
        Ok(())
    }

    /// Stop fetching and requeue whatever is still unfinished
    ///
    /// Waits up to the configured shutdown timeout for in-flight handlers.
    /// Handlers still running after that are aborted and their units
    /// bulk-requeued, and the call reports [`FetcherPoolError::ShutdownTimeout`].
    #[instrument(skip(self), fields(pool_id = %self.id))]
    pub async fn shutdown(&self) -> Result<(), FetcherPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                FetcherPoolStatus::Stopped => return Ok(()),
                FetcherPoolStatus::Draining => return Err(FetcherPoolError::NotRunning),
                _ => *status = FetcherPoolStatus::Draining,
            }
        }

        info!(pool_id = %self.id, "Marking fetching done");
        self.control.mark_fetching_done();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let stragglers: Vec<InFlight> = self
            .in_flight
            .lock()
            .drain()
            .map(|(_, in_flight)| in_flight)
            .collect();

        let requeued = stragglers.len();
        if requeued > 0 {
            warn!(
                pool_id = %self.id,
                count = requeued,
                "Shutdown timeout reached, requeueing unfinished units"
            );
            let units = stragglers
                .into_iter()
                .map(|in_flight| {
                    in_flight.abort.abort();
                    in_flight.unit
                })
                .collect();
            self.strategy.bulk_requeue(units).await;
        }

        let dispatch = self.dispatch_handle.lock().take();
        if let Some(handle) = dispatch {
            if let Err(e) = handle.await {
                warn!(pool_id = %self.id, error = %e, "Dispatcher ended abnormally");
            }
        }

        *self.status.write() = FetcherPoolStatus::Stopped;
        info!(pool_id = %self.id, "Fetcher pool stopped");

        if requeued > 0 {
            Err(FetcherPoolError::ShutdownTimeout { requeued })
        } else {
            Ok(())
        }
    }
}

/// Receives assigned units and runs the handler for each
struct Dispatcher {
    engines: Vec<Arc<FetchEngine>>,
    handler: WorkHandler,
    strategy: Arc<dyn RetrievalStrategy>,
    in_flight: InFlightMap,
    signal: FetchSignal,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<(usize, UnitOfWork)>) {
        loop {
            tokio::select! {
                biased;
                _ = self.signal.done() => break,
                received = rx.recv() => match received {
                    Some((slot, unit)) => self.dispatch(slot, unit),
                    None => break,
                },
            }
        }

        // Engines whose retrieval finishes from here on see a closed channel
        // and requeue through their strategy; units already queued go back now.
        rx.close();
        let mut leftovers = Vec::new();
        while let Some((_, unit)) = rx.recv().await {
            leftovers.push(unit);
        }
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "Requeueing units assigned after shutdown");
            self.strategy.bulk_requeue(leftovers).await;
        }
    }

    fn dispatch(&self, slot: usize, unit: UnitOfWork) {
        let Some(engine) = self.engines.get(slot).cloned() else {
            warn!(slot, queue = %unit.queue_name(), "Unit assigned to unknown slot, requeueing");
            let strategy = Arc::clone(&self.strategy);
            tokio::spawn(async move {
                unit.requeue(strategy.as_ref()).await;
            });
            return;
        };

        let handler_task = tokio::spawn((self.handler)(unit.clone()));
        self.in_flight.lock().insert(
            slot,
            InFlight {
                unit,
                abort: handler_task.abort_handle(),
            },
        );

        let strategy = Arc::clone(&self.strategy);
        let in_flight = Arc::clone(&self.in_flight);

        tokio::spawn(async move {
            let outcome = match handler_task.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!(slot, error = %e, "Handler panicked, requeueing unit");
                    WorkOutcome::Requeue
                }
                Err(_) => WorkOutcome::Requeue,
            };

            // Shutdown drains the map before aborting, so an aborted handler
            // finds no entry and its unit is not requeued twice.
            let finished = in_flight.lock().remove(&slot);
            if let Some(finished) = finished {
                match outcome {
                    WorkOutcome::Acknowledge => finished.unit.acknowledge(),
                    WorkOutcome::Requeue => {
                        finished.unit.requeue(strategy.as_ref()).await;
                    }
                }
            }

            engine.fetch();
        });
    }
}
