//! USB webcam capture through V4L2 memory-mapped streaming

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::CaptureBackend;
use super::decoder;
use super::frame::{PixelFormat, RawImage, SequenceMarker};
use crate::error::{OpenError, ReadError};
use crate::{utils, CaptureSourceConfig};

const BUFFER_COUNT: u32 = 4;

pub struct V4l2Capture {
    stream: Option<MmapStream<'static>>,
    device: Device,
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl V4l2Capture {
    /// Open by numeric index, `/dev/video*` path, or device name, and apply
    /// the non-zero resolution and frame-rate hints.
    #[instrument(skip(config), fields(source = %config.source))]
    pub fn open(config: &CaptureSourceConfig) -> Result<Self, OpenError> {
        let device = resolve_device(&config.source)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(OpenError::NotCapture {
                device: config.source.clone(),
            });
        }

        let mut fmt = device.format()?;
        if let Some(res) = config.resolution {
            if res.width != 0 {
                fmt.width = res.width;
            }
            if res.height != 0 {
                fmt.height = res.height;
            }
        }

        // Prefer MJPEG; fall back to YUYV for cameras without it.
        fmt.fourcc = FourCC::new(b"MJPG");
        let mut fmt = device.set_format(&fmt)?;
        if pixel_format_of(fmt.fourcc).is_none() {
            fmt.fourcc = FourCC::new(b"YUYV");
            fmt = device.set_format(&fmt)?;
        }
        let format = pixel_format_of(fmt.fourcc)
            .ok_or_else(|| OpenError::Format(fmt.fourcc.to_string()))?;

        if let Some(fps) = config.fps_cap.filter(|&fps| fps != 0) {
            let params = device.set_params(&Parameters::with_fps(fps))?;
            debug!(requested = fps, interval = %params.interval, "frame rate applied");
        }

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)?;
        info!(
            width = fmt.width,
            height = fmt.height,
            ?format,
            "capture stream started with {} buffers",
            BUFFER_COUNT
        );

        Ok(Self {
            stream: Some(stream),
            device,
            name: caps.card,
            width: fmt.width,
            height: fmt.height,
            format,
        })
    }

    /// Best-effort reset after a failed dequeue: requeue a fresh set of buffers.
    fn rewind(&mut self) {
        self.stream = None;
        match MmapStream::with_buffers(&self.device, Type::VideoCapture, BUFFER_COUNT) {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => debug!(device = %self.name, error = %e, "stream reset failed"),
        }
    }
}

impl CaptureBackend for V4l2Capture {
    fn describe(&self) -> String {
        format!("v4l2 {} {}x{} {:?}", self.name, self.width, self.height, self.format)
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn read_one(&mut self) -> Result<Option<RawImage>, ReadError> {
        let (format, width, height) = (self.format, self.width, self.height);
        let stream = self.stream.as_mut().ok_or(ReadError::NotStarted)?;

        let pulled = stream.next().map(|(buf, meta)| {
            let used = match meta.bytesused as usize {
                0 => buf.len(),
                n => n.min(buf.len()),
            };
            (
                decoder::decode_frame(&buf[..used], format, width, height),
                meta.sequence,
            )
        });
        let (decoded, sequence) = match pulled {
            Ok(pulled) => pulled,
            Err(e) => {
                self.rewind();
                return Err(e.into());
            }
        };

        match decoded {
            Ok(image) => Ok(Some(RawImage::from_decoded(
                image,
                SequenceMarker::FrameIndex(sequence as u64),
            ))),
            Err(e) => {
                warn!(device = %self.name, error = %e, "dropping undecodable frame");
                metrics::counter!("capture_frames_dropped_total", "reason" => "decode")
                    .increment(1);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            info!(device = %self.name, "capture stream stopped");
        }
    }
}

fn resolve_device(source: &str) -> Result<Device, OpenError> {
    if let Ok(index) = source.parse::<usize>() {
        return Ok(Device::new(index)?);
    }
    if source.starts_with("/dev/") {
        return Ok(Device::with_path(source)?);
    }
    let index =
        utils::camera_index_by_name(source).ok_or_else(|| OpenError::NotFound(source.into()))?;
    Ok(Device::new(index)?)
}

fn pixel_format_of(fourcc: FourCC) -> Option<PixelFormat> {
    match &fourcc.repr {
        b"MJPG" => Some(PixelFormat::Mjpeg),
        b"YUYV" => Some(PixelFormat::Yuyv4),
        b"RGB3" => Some(PixelFormat::Rgb24),
        _ => None,
    }
}
