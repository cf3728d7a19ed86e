//! Process-wide cooperative shutdown.
//!
//! The signal is the disconnection of a flume channel nobody ever sends on:
//! dropping the only sender wakes every receiver at once, whether it waits
//! from the blocking capture thread or from an async task.

use std::sync::Mutex;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

/// Owner side; fires the signal once
#[derive(Debug)]
pub struct Shutdown {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

/// Cloneable listener handed to every long-running task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Receiver<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.rx.clone(),
        }
    }

    /// Fire the signal. Idempotent.
    pub fn trigger(&self) {
        let sender = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        self.rx.is_disconnected()
    }

    /// Block the current thread for up to `timeout`; returns `true` as soon
    /// as shutdown fires.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Resolve once shutdown fires
    pub async fn triggered(&self) {
        while self.rx.recv_async().await.is_ok() {}
    }
}
