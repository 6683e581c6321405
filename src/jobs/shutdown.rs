// Process-wide shutdown signal
//
// Triggering drops the only sender of a channel nobody ever writes to, so
// every blocked receiver wakes at once with `Disconnected`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

struct Inner {
    requested: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                requested: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
                receiver: rx,
            }),
        }
    }

    pub fn trigger(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.sender.lock() {
            guard.take();
        }
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless shutdown arrives first.
    /// Returns true when shutdown has been requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.inner.receiver.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => self.is_requested(),
        }
    }

    /// Receiver that becomes ready (disconnected) on shutdown, for `select!`.
    pub fn receiver(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
