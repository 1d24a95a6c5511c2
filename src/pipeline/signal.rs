//! Consumer→producer signals: frame requests and cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

/// Single-slot "send me one frame" signal.
///
/// The consumer calls [`request`](Self::request); the producer's bounded
/// [`wait`](Self::wait) takes the request out as a [`Permit`], and the permit
/// is spent by the hand-off push. A second `request` while one is still
/// pending is a no-op.
#[derive(Debug, Clone)]
pub struct RequestToken {
    tx: Sender<()>,
    rx: Receiver<()>,
}

/// Right to push exactly one frame downstream.
#[derive(Debug)]
#[must_use = "a permit is only spent by pushing a frame"]
pub struct Permit(());

impl RequestToken {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self { tx, rx }
    }

    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }

    pub fn is_requested(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Wait up to `timeout` for a request.
    pub fn wait(&self, timeout: Duration) -> Option<Permit> {
        self.rx.recv_timeout(timeout).ok().map(|()| Permit(()))
    }

    pub fn try_take(&self) -> Option<Permit> {
        self.rx.try_recv().ok().map(|()| Permit(()))
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire-once stop signal shared by the shell and the capture thread.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    fired: AtomicBool,
    // Dropping the sender wakes every waiter at once.
    trigger: Mutex<Option<Sender<()>>>,
    wake: Receiver<()>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(0);
        Self {
            inner: Arc::new(CancelInner {
                fired: AtomicBool::new(false),
                trigger: Mutex::new(Some(tx)),
                wake: rx,
            }),
        }
    }

    pub fn fire(&self) {
        self.inner.fired.store(true, Ordering::Release);
        self.inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    /// Sleep up to `timeout`, returning early with `true` once fired.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_fired() {
            return true;
        }
        match self.inner.wake.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            _ => self.is_fired(),
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}
