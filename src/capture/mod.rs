pub mod backend;
pub mod decoder;
pub mod frame;
pub mod framer;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_capture;
pub mod machine;
pub mod normalize;
pub mod rate;
pub mod serial;
#[cfg(target_os = "linux")]
pub mod v4l2;

pub use backend::{CaptureBackend, Connector, DeviceConnector};
pub use frame::{PixelFormat, RawFrame, RawImage, SequenceMarker};
pub use framer::{Extracted, FrameFramer, SerialFrame};
pub use machine::{CameraState, CaptureStateMachine, ReconnectReason, Tick, Timing};
pub use normalize::ResolutionNormalizer;
pub use rate::RateEstimator;
pub use serial::SerialBackend;
#[cfg(target_os = "linux")]
pub use v4l2::V4l2Capture;
