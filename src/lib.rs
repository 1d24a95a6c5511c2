pub mod capture;
pub mod error;
pub mod pipeline;
pub mod utils;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

pub use capture::{CameraState, CaptureStateMachine, RawFrame};
pub use error::{FrameDecodeError, FramingCorruption, OpenError, ReadError};
pub use pipeline::{CancellationSignal, HandoffQueue, RequestToken};

/// Environment prefix for configuration overrides, e.g. `FRAMESOURCE_CAPTURE__SOURCE`.
pub const ENV_PREFIX: &str = "FRAMESOURCE";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureSettings,
    pub pipeline: PipelineSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Device index, device name, stream URI or serial port. Empty means "not configured yet".
    pub source: String,
    pub backend: UsbBackend,
    /// Zero leaves the device default in place.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pin_to_core: Option<usize>,
    pub nice: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub idle_poll_ms: u64,
    pub request_poll_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_resolution: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub filter: String,
}

/// Which library drives USB/webcam sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbBackend {
    #[default]
    V4l2,
    GStreamer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Immutable snapshot of what the capture thread should be connected to.
///
/// Any field changing between two snapshots invalidates the open connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureSourceConfig {
    pub source: String,
    pub backend: UsbBackend,
    pub resolution: Option<Resolution>,
    pub fps_cap: Option<u32>,
}

/// How a source string is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind<'a> {
    Serial(&'a str),
    Usb(UsbBackend),
}

impl CaptureSourceConfig {
    pub fn new(source: impl Into<String>, backend: UsbBackend) -> Self {
        Self {
            source: source.into(),
            backend,
            resolution: None,
            fps_cap: None,
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some(Resolution { width, height });
        self
    }

    pub fn with_fps_cap(mut self, fps: u32) -> Self {
        self.fps_cap = Some(fps);
        self
    }

    pub fn kind(&self) -> SourceKind<'_> {
        if is_serial_source(&self.source) {
            SourceKind::Serial(&self.source)
        } else {
            SourceKind::Usb(self.backend)
        }
    }
}

/// Serial ports show up as `COMn` on Windows and as tty/cu nodes elsewhere.
pub fn is_serial_source(source: &str) -> bool {
    source.contains("COM") || source.starts_with("/dev/tty") || source.starts_with("/dev/cu.")
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            source: String::new(),
            backend: UsbBackend::V4l2,
            width: 0,
            height: 0,
            fps: 0,
            pin_to_core: None,
            nice: None,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            idle_poll_ms: 100,
            request_poll_ms: 1,
            reconnect_backoff_ms: 100,
            max_resolution: capture::normalize::MAX_RESOLUTION,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "framesource=info".into(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then apply `FRAMESOURCE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Snapshot of the capture source, or `None` while no source is configured.
    pub fn source_config(&self) -> Option<CaptureSourceConfig> {
        let capture = &self.capture;
        let source = capture.source.trim();
        if source.is_empty() {
            return None;
        }
        let resolution = (capture.width != 0 || capture.height != 0).then_some(Resolution {
            width: capture.width,
            height: capture.height,
        });
        Some(CaptureSourceConfig {
            source: source.to_string(),
            backend: capture.backend,
            resolution,
            fps_cap: (capture.fps != 0).then_some(capture.fps),
        })
    }
}

impl PipelineSettings {
    pub fn timing(&self) -> capture::machine::Timing {
        capture::machine::Timing {
            idle_poll: Duration::from_millis(self.idle_poll_ms),
            request_poll: Duration::from_millis(self.request_poll_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }
}

/// Source configuration shared between the shell and the capture thread.
///
/// The shell stores whole snapshots; the capture thread loads one per loop iteration.
#[derive(Debug, Clone, Default)]
pub struct SourceHandle {
    inner: Arc<ArcSwapOption<CaptureSourceConfig>>,
}

impl SourceHandle {
    pub fn new(initial: Option<CaptureSourceConfig>) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::from_pointee(initial)),
        }
    }

    pub fn set(&self, config: Option<CaptureSourceConfig>) {
        self.inner.store(config.map(Arc::new));
    }

    pub fn load(&self) -> Option<Arc<CaptureSourceConfig>> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_serial_sources() {
        assert!(is_serial_source("COM4"));
        assert!(is_serial_source("/dev/ttyACM0"));
        assert!(is_serial_source("/dev/cu.usbmodem1101"));
        assert!(!is_serial_source("0"));
        assert!(!is_serial_source("/dev/video2"));
        assert!(!is_serial_source("http://192.168.1.20:81/stream"));
    }

    #[test]
    fn zero_settings_mean_no_hints() {
        let mut config = AppConfig::default();
        assert!(config.source_config().is_none());

        config.capture.source = "2".into();
        let snapshot = config.source_config().unwrap();
        assert_eq!(snapshot.resolution, None);
        assert_eq!(snapshot.fps_cap, None);

        config.capture.width = 640;
        config.capture.fps = 60;
        let snapshot = config.source_config().unwrap();
        assert_eq!(
            snapshot.resolution,
            Some(Resolution {
                width: 640,
                height: 0
            })
        );
        assert_eq!(snapshot.fps_cap, Some(60));
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = SourceHandle::new(None);
        assert!(handle.load().is_none());

        let config = CaptureSourceConfig::new("COM3", UsbBackend::V4l2);
        handle.set(Some(config.clone()));
        assert_eq!(handle.load().as_deref(), Some(&config));
        assert!(matches!(config.kind(), SourceKind::Serial("COM3")));
    }
}
