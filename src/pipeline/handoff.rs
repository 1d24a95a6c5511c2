//! Bounded capture→consumer hand-off with backpressure reporting

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use flume::{Receiver, SendTimeoutError, Sender, TrySendError};
use thiserror::Error;
use tracing::warn;

use super::signal::{CancellationSignal, Permit};
use crate::capture::RawFrame;

pub const HANDOFF_CAPACITY: usize = 2;
// How often a blocked push re-checks cancellation.
const PUSH_POLL: Duration = Duration::from_millis(5);

#[derive(Error, Debug)]
pub enum PushError {
    #[error("capture cancelled while the queue was full")]
    Cancelled(RawFrame),
    #[error("frame consumer is gone")]
    Disconnected(RawFrame),
}

/// Producer half, owned by the capture thread.
pub struct HandoffQueue {
    tx: Sender<RawFrame>,
    stats: Arc<CachePadded<Stats>>,
}

/// Consumer half.
#[derive(Clone)]
pub struct FrameConsumer {
    rx: Receiver<RawFrame>,
    stats: Arc<CachePadded<Stats>>,
}

#[derive(Default)]
struct Stats {
    frames_pushed: AtomicUsize,
    frames_popped: AtomicUsize,
    backpressure_warnings: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffStats {
    pub frames_pushed: usize,
    pub frames_popped: usize,
    pub backpressure_warnings: usize,
}

impl HandoffQueue {
    pub fn channel() -> (HandoffQueue, FrameConsumer) {
        let (tx, rx) = flume::bounded(HANDOFF_CAPACITY);
        let stats = Arc::new(CachePadded::new(Stats::default()));
        (
            HandoffQueue {
                tx,
                stats: stats.clone(),
            },
            FrameConsumer { rx, stats },
        )
    }

    /// Deliver a frame, spending the request permit.
    ///
    /// Occupancy above one is reported as backpressure but the push still
    /// goes ahead, blocking until a slot frees up. Frames are never
    /// overwritten.
    pub fn push(
        &self,
        frame: RawFrame,
        permit: Permit,
        cancel: &CancellationSignal,
    ) -> Result<(), PushError> {
        let occupancy = self.tx.len();
        if occupancy > 1 {
            warn!(
                occupancy,
                "backpressure on frame queue; consumer is not keeping up with requests"
            );
            self.stats
                .backpressure_warnings
                .fetch_add(1, Ordering::Relaxed);
            metrics::counter!("capture_backpressure_warnings_total").increment(1);
        }

        let mut frame = frame;
        loop {
            match self.tx.send_timeout(frame, PUSH_POLL) {
                Ok(()) => {
                    self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                    return Ok(());
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    if cancel.is_fired() {
                        return Err(PushError::Cancelled(back));
                    }
                    frame = back;
                }
                Err(SendTimeoutError::Disconnected(back)) => {
                    return Err(PushError::Disconnected(back));
                }
            }
        }
    }

    /// Non-blocking push. A full queue hands the frame and permit back untouched.
    pub fn try_push(&self, frame: RawFrame, permit: Permit) -> Result<(), (RawFrame, Permit)> {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
                Ok(())
            }
            Err(TrySendError::Full(frame) | TrySendError::Disconnected(frame)) => Err((frame, permit)),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn stats(&self) -> HandoffStats {
        self.stats.snapshot()
    }
}

impl FrameConsumer {
    pub fn pop(&self) -> Option<RawFrame> {
        let frame = self.rx.try_recv().ok()?;
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RawFrame> {
        let frame = self.rx.recv_timeout(timeout).ok()?;
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub async fn recv_async(&self) -> Option<RawFrame> {
        let frame = self.rx.recv_async().await.ok()?;
        self.stats.frames_popped.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> HandoffStats {
        self.stats.snapshot()
    }
}

impl Stats {
    fn snapshot(&self) -> HandoffStats {
        HandoffStats {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_popped: self.frames_popped.load(Ordering::Relaxed),
            backpressure_warnings: self.backpressure_warnings.load(Ordering::Relaxed),
        }
    }
}
