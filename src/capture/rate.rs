use std::time::Instant;

const SAMPLE_WEIGHT: f64 = 0.02;

/// Exponential moving average of frame rate and bandwidth.
///
/// There is no reset: after a reconnect the estimate simply decays toward the
/// new conditions.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    last_frame: Instant,
    fps: f64,
    bps: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self {
            last_frame: start,
            fps: 0.0,
            bps: 0.0,
        }
    }

    /// Record a frame of `frame_bytes` arriving now; returns the updated fps.
    pub fn update(&mut self, frame_bytes: usize) -> f64 {
        self.update_at(Instant::now(), frame_bytes)
    }

    pub fn update_at(&mut self, now: Instant, frame_bytes: usize) -> f64 {
        let delta = now.saturating_duration_since(self.last_frame).as_secs_f64();
        self.last_frame = now;
        let instant_fps = if delta > 0.0 { 1.0 / delta } else { 0.0 };
        self.fps = SAMPLE_WEIGHT * instant_fps + (1.0 - SAMPLE_WEIGHT) * self.fps;
        self.bps = frame_bytes as f64 * self.fps;
        self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.bps
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}
