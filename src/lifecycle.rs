//! Shutdown signalling
//!
//! A stop request is observed at every suspension point of the logger: scan
//! waits, connect waits, backoff waits and the wait for the next notification.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::NusError;

/// Owner side of the stop request
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

/// Observer side of the stop request
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Create a new handle and its first signal
    pub fn channel() -> (Self, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (Self { sender }, ShutdownSignal { receiver })
    }

    /// Request a stop. Safe to call more than once and from any thread.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether a stop has been requested
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Create another signal observing this handle
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        // Without a sender `cancelled` pends forever.
        let (_, receiver) = watch::channel(false);
        Self { receiver }
    }

    /// Whether a stop has been requested
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once a stop has been requested
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|stopped| *stopped).await.is_err() {
            // Handle dropped without a stop: nothing can trigger anymore.
            futures::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless a stop arrives first
    pub async fn sleep(&self, duration: Duration) -> Result<(), NusError> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `fut` to completion unless a stop arrives first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, NusError> {
        if self.is_cancelled() {
            return Err(NusError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(NusError::Cancelled),
            output = fut => Ok(output),
        }
    }
}
