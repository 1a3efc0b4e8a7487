//! Cooperative cancellation of the in-flight operation of a worker.
//!
//! Each worker owns one [`CancelTrigger`]. The flag is cleared whenever the
//! worker dequeues a message, so a cancellation request only ever affects
//! the operation that is running when it arrives. Providers observe the
//! paired [`CancelSignal`] while they wait on the backend, on the management
//! port or on a configuration run; everything else runs to completion.

use tokio::sync::watch;

/// Write side, held by the worker handle.
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request cancellation of the running operation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Clear the flag before the next operation starts.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancelTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side, observed at suspension points.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Trigger dropped without firing.
                std::future::pending::<()>().await;
            }
        }
    }
}
