//! GStreamer-based capture: webcams by index or name, plus file and network URIs

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use tracing::{debug, info, instrument, warn};

use super::backend::CaptureBackend;
use super::frame::{RawImage, SequenceMarker};
use crate::error::{OpenError, ReadError};
use crate::{utils, CaptureSourceConfig};

const PULL_TIMEOUT: gst::ClockTime = gst::ClockTime::from_seconds(2);

pub struct GstCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    source: String,
    sequence: u64,
    playing: bool,
}

impl GstCapture {
    #[instrument(skip(config), fields(source = %config.source))]
    pub fn open(config: &CaptureSourceConfig) -> Result<Self, OpenError> {
        gst::init().map_err(|e| OpenError::Pipeline(format!("GStreamer init: {e}")))?;

        let description = pipeline_description(config)?;
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(|e| OpenError::Pipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| OpenError::Pipeline("not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| OpenError::Pipeline("appsink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| OpenError::Pipeline("appsink downcast failed".into()))?;

        appsink.set_property("max-buffers", 2u32);
        appsink.set_property("drop", true); // Drop old buffers if we can't keep up
        appsink.set_property("sync", false); // Don't sync to clock for lowest latency

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| OpenError::Pipeline(format!("failed to start pipeline: {e:?}")))?;

        let (state_change, _, _) = pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        if let Err(e) = state_change {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(OpenError::Pipeline(format!("pipeline did not start: {e:?}")));
        }

        Ok(Self {
            pipeline,
            appsink,
            source: config.source.clone(),
            sequence: 0,
            playing: true,
        })
    }

    /// Seek back to the start; only meaningful for file sources.
    fn rewind(&self) {
        if let Err(e) = self.pipeline.seek_simple(
            gst::SeekFlags::FLUSH | gst::SeekFlags::KEY_UNIT,
            gst::ClockTime::ZERO,
        ) {
            debug!(source = %self.source, error = %e, "position reset not supported");
        }
    }

    fn pipeline_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let message = bus.pop_filtered(&[gst::MessageType::Error])?;
        match message.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }
}

impl CaptureBackend for GstCapture {
    fn describe(&self) -> String {
        format!("gstreamer {}", self.source)
    }

    fn is_open(&self) -> bool {
        self.playing
    }

    fn read_one(&mut self) -> Result<Option<RawImage>, ReadError> {
        let Some(sample) = self.appsink.try_pull_sample(PULL_TIMEOUT) else {
            if self.appsink.is_eos() {
                self.rewind();
                return Err(ReadError::EndOfStream);
            }
            if let Some(error) = self.pipeline_error() {
                self.rewind();
                return Err(ReadError::Pipeline(error));
            }
            return Ok(None);
        };

        let image = match sample_to_rgb(&sample) {
            Ok(image) => image,
            Err(reason) => {
                warn!(source = %self.source, reason, "dropping unreadable sample");
                metrics::counter!("capture_frames_dropped_total", "reason" => "decode")
                    .increment(1);
                return Ok(None);
            }
        };

        self.sequence += 1;
        Ok(Some(RawImage::from_decoded(
            image,
            SequenceMarker::FrameIndex(self.sequence),
        )))
    }

    fn close(&mut self) {
        if !self.playing {
            return;
        }
        self.playing = false;
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(source = %self.source, "failed to stop pipeline: {:?}", e);
        } else {
            info!(source = %self.source, "pipeline stopped");
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copy an RGB sample into a tightly packed image, honouring row stride.
fn sample_to_rgb(sample: &gst::Sample) -> Result<RgbImage, &'static str> {
    let buffer = sample.buffer().ok_or("sample contains no buffer")?;
    let caps = sample.caps().ok_or("sample has no caps")?;
    let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| "unparseable caps")?;
    let map = buffer.map_readable().map_err(|_| "buffer not readable")?;

    let (width, height) = (info.width(), info.height());
    let stride = info.stride()[0] as usize;
    let row = width as usize * 3;
    let data = map.as_slice();
    if height == 0 || stride < row || data.len() < stride * (height as usize - 1) + row {
        return Err("buffer smaller than caps");
    }

    let mut pixels = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        pixels.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    RgbImage::from_raw(width, height, pixels).ok_or("buffer smaller than caps")
}

fn pipeline_description(config: &CaptureSourceConfig) -> Result<String, OpenError> {
    let source = config.source.trim();
    let input = if source.contains("://") {
        format!("uridecodebin uri={source}")
    } else if let Ok(index) = source.parse::<usize>() {
        camera_element(index)
    } else if source.starts_with("/dev/") {
        format!("v4l2src device={source}")
    } else if std::path::Path::new(source).is_file() {
        format!("filesrc location=\"{source}\" ! decodebin")
    } else {
        let index = utils::camera_index_by_name(source)
            .ok_or_else(|| OpenError::NotFound(source.to_string()))?;
        camera_element(index)
    };

    let mut caps = String::from("video/x-raw,format=RGB");
    if let Some(res) = config.resolution {
        if res.width != 0 {
            caps.push_str(&format!(",width={}", res.width));
        }
        if res.height != 0 {
            caps.push_str(&format!(",height={}", res.height));
        }
    }
    let rate = match config.fps_cap.filter(|&fps| fps != 0) {
        Some(fps) => {
            caps.push_str(&format!(",framerate={fps}/1"));
            "videorate ! "
        }
        None => "",
    };

    Ok(format!(
        "{input} ! videoconvert ! videoscale ! {rate}{caps} ! appsink name=appsink"
    ))
}

fn camera_element(index: usize) -> String {
    if cfg!(target_os = "linux") {
        format!("v4l2src device=/dev/video{index}")
    } else if cfg!(target_os = "macos") {
        format!("avfvideosrc device-index={index}")
    } else {
        format!("mfvideosrc device-index={index}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UsbBackend;

    #[test]
    fn describes_index_source_with_hints() {
        let config = CaptureSourceConfig::new("1", UsbBackend::GStreamer)
            .with_resolution(640, 0)
            .with_fps_cap(30);
        let description = pipeline_description(&config).unwrap();
        assert!(description.contains(&camera_element(1)));
        assert!(description.contains("video/x-raw,format=RGB,width=640,framerate=30/1"));
        assert!(description.contains("videorate ! "));
        assert!(!description.contains("height="));
    }

    #[test]
    fn describes_uri_source() {
        let config = CaptureSourceConfig::new("http://10.0.0.5:81/stream", UsbBackend::GStreamer);
        let description = pipeline_description(&config).unwrap();
        assert!(description.starts_with("uridecodebin uri=http://10.0.0.5:81/stream ! "));
        assert!(description.ends_with("video/x-raw,format=RGB ! appsink name=appsink"));
    }
}
