//! Failure taxonomy of the capture engine.
//!
//! None of these are fatal: the state machine turns open and read failures
//! into `CameraState::Disconnected` and retries, and frame-level failures
//! only drop the frame.

use thiserror::Error;

/// The device or port could not be opened.
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("no capture device matches '{0}'")]
    NotFound(String),
    #[error("device {device} cannot capture video")]
    NotCapture { device: String },
    #[error("{0} backend is not available in this build")]
    Unsupported(&'static str),
    #[error("failed to open serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("no usable pixel format: {0}")]
    Format(String),
    #[error("device I/O failed during open: {0}")]
    Io(#[from] std::io::Error),
    #[error("pipeline setup failed: {0}")]
    Pipeline(String),
}

/// A pull from an open source failed; the connection is considered lost.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("capture stream not started")]
    NotStarted,
    #[error("end of stream")]
    EndOfStream,
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port fault: {0}")]
    Serial(#[from] serialport::Error),
    #[error("pipeline error: {0}")]
    Pipeline(String),
}

/// Bytes were framed correctly but are not a usable image.
#[derive(Error, Debug)]
pub enum FrameDecodeError {
    #[error("jpeg decode failed: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("decoder returned no image info")]
    MissingInfo,
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    #[error("buffer holds {actual} bytes, {expected} expected for {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A framing candidate on the serial stream failed validation.
///
/// Expected under normal operation (for instance right after a skip-ahead),
/// so it is reported at debug level only.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingCorruption {
    #[error("expected jpeg end marker, found {found:02x?}")]
    MissingEndMarker { found: [u8; 2] },
    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },
}
