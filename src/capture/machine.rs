//! Connection lifecycle and the produce/publish loop of the capture thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::backend::{CaptureBackend, Connector, DeviceConnector};
use super::frame::RawFrame;
use super::normalize::ResolutionNormalizer;
use super::rate::RateEstimator;
use crate::pipeline::{CancellationSignal, HandoffQueue, Permit, PushError, RequestToken};
use crate::{utils, CaptureSourceConfig, SourceHandle};

/// Connection status published to the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

/// Bounded waits of the capture loop.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// Sleep while no source is configured.
    pub idle_poll: Duration,
    /// Wait for a frame request before re-checking connection health.
    pub request_poll: Duration,
    /// Pause before every open attempt after the first.
    pub reconnect_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_millis(100),
            request_poll: Duration::from_millis(1),
            reconnect_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectReason {
    Initial,
    /// The open connection was made for a different source snapshot.
    ConfigMismatch,
    NotOpen,
}

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No source configured.
    Idle,
    /// Source configured but not present (serial port not enumerated).
    Unavailable,
    /// Connected, nobody asked for a frame.
    AwaitingRequest,
    /// First frame after connecting was read and discarded.
    WarmedUp,
    /// Backend had nothing complete this time.
    Pending,
    Delivered,
    /// Open or read failed; the connection is gone.
    Lost,
    Exit,
}

pub struct CaptureStateMachine<C: Connector = DeviceConnector> {
    connector: C,
    source: SourceHandle,
    queue: HandoffQueue,
    request: RequestToken,
    cancel: CancellationSignal,
    status: watch::Sender<CameraState>,
    timing: Timing,
    normalizer: ResolutionNormalizer,
    rate: RateEstimator,
    backend: Option<Box<dyn CaptureBackend>>,
    active: Option<Arc<CaptureSourceConfig>>,
    warming_up: bool,
    permit: Option<Permit>,
}

impl<C: Connector> CaptureStateMachine<C> {
    pub fn new(
        connector: C,
        source: SourceHandle,
        queue: HandoffQueue,
        request: RequestToken,
        cancel: CancellationSignal,
    ) -> Self {
        let (status, _) = watch::channel(CameraState::Connecting);
        Self {
            connector,
            source,
            queue,
            request,
            cancel,
            status,
            timing: Timing::default(),
            normalizer: ResolutionNormalizer::default(),
            rate: RateEstimator::new(),
            backend: None,
            active: None,
            warming_up: false,
            permit: None,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ResolutionNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Watch the connection status from another thread or task.
    pub fn status(&self) -> watch::Receiver<CameraState> {
        self.status.subscribe()
    }

    pub fn state(&self) -> CameraState {
        *self.status.borrow()
    }

    /// Run one iteration of the capture loop.
    pub fn tick(&mut self) -> Tick {
        if self.cancel.is_fired() {
            return Tick::Exit;
        }

        let Some(config) = self.source.load() else {
            if self.backend.is_some() {
                self.teardown();
            }
            if self.cancel.wait(self.timing.idle_poll) {
                self.set_state(CameraState::Disconnected);
                return Tick::Exit;
            }
            return Tick::Idle;
        };

        if let Some(reason) = self.reconnect_reason(&config) {
            if let Some(tick) = self.connect(config, reason) {
                return tick;
            }
        }

        // Only a settled connection waits for requests; a fresh one reads its
        // warm-up frame right away.
        if !self.warming_up && self.permit.is_none() {
            match self.request.wait(self.timing.request_poll) {
                Some(permit) => self.permit = Some(permit),
                None => return Tick::AwaitingRequest,
            }
        }
        if self.cancel.is_fired() {
            return Tick::Exit;
        }

        let Some(backend) = self.backend.as_mut() else {
            return Tick::Lost;
        };
        let raw = match backend.read_one() {
            Ok(Some(raw)) => raw,
            Ok(None) => return Tick::Pending,
            Err(e) => {
                warn!(backend = %backend.describe(), error = %e, "capture read failed");
                self.teardown();
                return Tick::Lost;
            }
        };

        let fps = self.rate.update(raw.byte_len);
        metrics::gauge!("capture_fps").set(fps);
        metrics::gauge!("capture_bytes_per_second").set(self.rate.bytes_per_second());

        if self.warming_up {
            // The first frame after (re)connecting is recorded during device
            // stabilisation and never delivered.
            self.warming_up = false;
            debug!("discarded warm-up frame");
            self.set_state(CameraState::Connected);
            return Tick::WarmedUp;
        }

        let Some(permit) = self.permit.take() else {
            return Tick::Pending;
        };
        let frame = RawFrame {
            image: self.normalizer.normalize(raw.image),
            sequence: raw.sequence,
            fps,
            captured_at: Instant::now(),
        };
        match self.queue.push(frame, permit, &self.cancel) {
            Ok(()) => {
                metrics::counter!("capture_frames_delivered_total").increment(1);
                Tick::Delivered
            }
            Err(PushError::Cancelled(_)) => Tick::Exit,
            Err(PushError::Disconnected(_)) => {
                info!("frame consumer dropped, stopping capture");
                Tick::Exit
            }
        }
    }

    /// Loop until cancelled, then release the device.
    pub fn run(mut self) {
        info!("capture loop started");
        while self.tick() != Tick::Exit {}
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        info!("capture loop exited");
    }

    fn reconnect_reason(&self, config: &CaptureSourceConfig) -> Option<ReconnectReason> {
        let Some(active) = &self.active else {
            return Some(ReconnectReason::Initial);
        };
        if active.as_ref() != config {
            return Some(ReconnectReason::ConfigMismatch);
        }
        match &self.backend {
            Some(backend) if backend.is_open() => None,
            _ => Some(ReconnectReason::NotOpen),
        }
    }

    /// Returns `None` once a backend is open and ready for its warm-up read.
    fn connect(
        &mut self,
        config: Arc<CaptureSourceConfig>,
        reason: ReconnectReason,
    ) -> Option<Tick> {
        if self.backend.is_some() {
            self.teardown();
        }
        debug!(?reason, source = %config.source, "connecting capture source");

        if reason != ReconnectReason::Initial && self.cancel.wait(self.timing.reconnect_backoff) {
            return Some(Tick::Exit);
        }

        self.active = Some(config.clone());
        match self.connector.open(&config) {
            Ok(Some(backend)) => {
                info!(backend = %backend.describe(), "capture source opened");
                metrics::counter!("capture_reconnects_total").increment(1);
                self.backend = Some(backend);
                self.warming_up = true;
                None
            }
            Ok(None) => {
                self.set_state(CameraState::Disconnected);
                Some(Tick::Unavailable)
            }
            Err(e) => {
                warn!(source = %config.source, error = %e, "failed to open capture source");
                self.set_state(CameraState::Disconnected);
                Some(Tick::Lost)
            }
        }
    }

    fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            backend.close();
        }
        self.warming_up = false;
        self.set_state(CameraState::Disconnected);
    }

    fn set_state(&self, next: CameraState) {
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = ?*current, to = ?next, "camera state changed");
            *current = next;
            true
        });
    }
}

impl<C: Connector + 'static> CaptureStateMachine<C> {
    /// Run on a dedicated `capture` thread, optionally pinned to one core.
    pub fn spawn(self, pin_to_core: Option<usize>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Some(core) = pin_to_core {
                    utils::pin_current_thread(core);
                }
                self.run();
            })
    }
}
