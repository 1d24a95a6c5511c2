use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Frame handed to the consumer through the hand-off queue.
///
/// Owned by the capture thread until pushed, then by the consumer.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub image: RgbImage,
    pub sequence: SequenceMarker,
    /// Smoothed frame rate at capture time.
    pub fps: f64,
    /// Capture timestamp for latency tracking
    pub captured_at: Instant,
}

/// Ordering marker attached to each frame.
///
/// Markers from different backends are not comparable with each other.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum SequenceMarker {
    /// Position in the USB stream.
    FrameIndex(u64),
    /// Wall-clock arrival time of a serial frame.
    WallClock(Duration),
}

impl SequenceMarker {
    pub fn wall_clock_now() -> Self {
        Self::WallClock(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default(),
        )
    }
}

/// One decoded pull from a backend, before rate stamping and normalization.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub image: RgbImage,
    pub sequence: SequenceMarker,
    /// Size fed into the bandwidth estimate (encoded bytes for serial, decoded for USB).
    pub byte_len: usize,
}

impl RawImage {
    pub fn from_decoded(image: RgbImage, sequence: SequenceMarker) -> Self {
        let byte_len = image.as_raw().len();
        Self {
            image,
            sequence,
            byte_len,
        }
    }
}

/// Pixel formats we accept from webcams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Yuyv4,
    Mjpeg,
}
