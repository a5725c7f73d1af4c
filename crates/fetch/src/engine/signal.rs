//! Shutdown signalling between a supervisor and its fetch engines

use std::time::Duration;

use tokio::sync::watch;

/// Supervisor side of the shutdown flag
///
/// Once [`mark_fetching_done`](Self::mark_fetching_done) is called every
/// engine holding a [`FetchSignal`] from this control stops at its next cycle
/// start. The flag never resets.
#[derive(Debug)]
pub struct FetchControl {
    tx: watch::Sender<bool>,
}

impl FetchControl {
    /// Create a control with fetching enabled
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A signal to inject into a fetch engine
    pub fn signal(&self) -> FetchSignal {
        FetchSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Stop all engines from starting new fetch cycles
    pub fn mark_fetching_done(&self) {
        self.tx.send_replace(true);
    }

    /// Whether fetching has been marked done
    pub fn is_done(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for FetchControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine side of the shutdown flag
#[derive(Debug, Clone)]
pub struct FetchSignal {
    rx: watch::Receiver<bool>,
}

impl FetchSignal {
    /// Whether the supervisor has stopped fetching
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once fetching is marked done
    ///
    /// Never resolves if the control is dropped without marking done.
    pub async fn done(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|done| *done).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, waking early if fetching is marked done
    ///
    /// Returns whether fetching is done.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.done() => {}
        }

        self.is_done()
    }
}
