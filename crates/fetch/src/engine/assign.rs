//! Hand-off of retrieved work to the supervisor

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::unit_of_work::UnitOfWork;

/// Receives units of work from a fetch engine
///
/// Returning `Err(unit)` means the supervisor cannot take the unit (it is
/// shutting down or gone); the engine then requeues it through its strategy.
#[async_trait]
pub trait WorkAssigner: Send + Sync + 'static {
    async fn assign(&self, unit: UnitOfWork) -> Result<(), UnitOfWork>;
}

#[async_trait]
impl WorkAssigner for mpsc::Sender<UnitOfWork> {
    async fn assign(&self, unit: UnitOfWork) -> Result<(), UnitOfWork> {
        self.send(unit).await.map_err(|rejected| rejected.0)
    }
}

#[async_trait]
impl WorkAssigner for mpsc::UnboundedSender<UnitOfWork> {
    async fn assign(&self, unit: UnitOfWork) -> Result<(), UnitOfWork> {
        self.send(unit).map_err(|rejected| rejected.0)
    }
}
