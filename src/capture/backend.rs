//! Capability set shared by every capture source, and the dispatch from a
//! source snapshot to the backend that can open it.

use crate::error::{OpenError, ReadError};
use crate::{CaptureSourceConfig, SourceKind, UsbBackend};

use super::frame::RawImage;
use super::serial::SerialBackend;

/// An open capture source.
pub trait CaptureBackend: Send {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    /// Pull one frame.
    ///
    /// `Ok(None)` means nothing usable arrived this time (no complete frame
    /// buffered yet, or a frame that failed to decode); the connection stays up.
    fn read_one(&mut self) -> Result<Option<RawImage>, ReadError>;

    fn close(&mut self);
}

/// Opens a backend for a source snapshot.
pub trait Connector: Send {
    /// `Ok(None)` means there is nothing to open yet (e.g. the serial port is
    /// not plugged in); it is not an error.
    fn open(
        &mut self,
        config: &CaptureSourceConfig,
    ) -> Result<Option<Box<dyn CaptureBackend>>, OpenError>;
}

/// Opens real devices, choosing the backend from the snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConnector;

impl Connector for DeviceConnector {
    fn open(
        &mut self,
        config: &CaptureSourceConfig,
    ) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
        match config.kind() {
            SourceKind::Serial(port) => {
                let available = crate::utils::available_serial_ports();
                Ok(SerialBackend::open_if_present(port, &available)?
                    .map(|backend| Box::new(backend) as Box<dyn CaptureBackend>))
            }
            SourceKind::Usb(UsbBackend::V4l2) => open_v4l2(config),
            SourceKind::Usb(UsbBackend::GStreamer) => open_gstreamer(config),
        }
    }
}

#[cfg(target_os = "linux")]
fn open_v4l2(config: &CaptureSourceConfig) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
    let capture = super::v4l2::V4l2Capture::open(config)?;
    Ok(Some(Box::new(capture)))
}

#[cfg(not(target_os = "linux"))]
fn open_v4l2(_config: &CaptureSourceConfig) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
    Err(OpenError::Unsupported("v4l2"))
}

#[cfg(feature = "gstreamer-pipeline")]
fn open_gstreamer(
    config: &CaptureSourceConfig,
) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
    let capture = super::gst_capture::GstCapture::open(config)?;
    Ok(Some(Box::new(capture)))
}

#[cfg(not(feature = "gstreamer-pipeline"))]
fn open_gstreamer(
    _config: &CaptureSourceConfig,
) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
    Err(OpenError::Unsupported("gstreamer"))
}
