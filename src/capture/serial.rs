//! Serial-attached JPEG camera.

use std::io::{self, Read};
use std::time::Duration;

use serialport::{ClearBuffer, FlowControl, SerialPort};
use tracing::{debug, info, instrument, warn};

use super::backend::CaptureBackend;
use super::decoder;
use super::frame::{RawImage, SequenceMarker};
use super::framer::{Extracted, FrameFramer, SerialFrame};
use crate::error::{OpenError, ReadError};

/// Unread OS-level bytes past which buffered frames are considered stale.
pub const BUFFER_SIZE: u32 = 32 * 1024;
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// The higher rate is not supported by the macOS driver stack.
pub fn baud_rate() -> u32 {
    if cfg!(target_os = "macos") {
        115_200
    } else {
        3_000_000
    }
}

/// Byte source underneath the serial backend.
pub trait SerialLink: Read + Send {
    /// Bytes received by the OS but not read yet.
    fn bytes_to_read(&self) -> io::Result<u32>;

    fn discard_input(&mut self) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn bytes_to_read(&self) -> io::Result<u32> {
        SerialPort::bytes_to_read(self.as_ref()).map_err(io::Error::from)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

pub struct SerialBackend<L: SerialLink = Box<dyn SerialPort>> {
    port: String,
    link: Option<L>,
    framer: FrameFramer,
}

impl SerialBackend {
    /// Open `port` if the OS currently lists it; otherwise there is nothing to do yet.
    #[instrument(skip(available))]
    pub fn open_if_present(port: &str, available: &[String]) -> Result<Option<Self>, OpenError> {
        if !available.iter().any(|name| name == port) {
            debug!("serial port not enumerated, skipping open");
            return Ok(None);
        }

        let baud = baud_rate();
        // serialport cannot size the driver buffers; the backlog flush in
        // read_one bounds latency instead.
        let link = serialport::new(port, baud)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| OpenError::Serial {
                port: port.to_string(),
                source,
            })?;

        info!(baud, "serial camera connected");
        Ok(Some(Self::with_link(port, link)))
    }
}

impl<L: SerialLink> SerialBackend<L> {
    pub fn with_link(port: impl Into<String>, link: L) -> Self {
        Self {
            port: port.into(),
            link: Some(link),
            framer: FrameFramer::new(),
        }
    }

    pub fn framer(&self) -> &FrameFramer {
        &self.framer
    }

    fn decode(&self, frame: SerialFrame) -> Option<RawImage> {
        let jpeg = frame.jpeg();
        match decoder::decode_jpeg(jpeg) {
            Ok(image) => Some(RawImage {
                image,
                sequence: SequenceMarker::wall_clock_now(),
                byte_len: jpeg.len(),
            }),
            Err(e) => {
                warn!(port = %self.port, error = %e, "dropping undecodable serial frame");
                metrics::counter!("capture_frames_dropped_total", "reason" => "decode").increment(1);
                None
            }
        }
    }

    /// The stream ran too far ahead of real time: everything queued is stale.
    fn flush_if_backlogged(&mut self) -> Result<(), ReadError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let waiting = link.bytes_to_read()?;
        if waiting >= BUFFER_SIZE {
            info!(port = %self.port, waiting, "discarding serial backlog");
            link.discard_input()?;
            self.framer.clear();
            metrics::counter!("serial_flushes_total").increment(1);
        }
        Ok(())
    }
}

impl<L: SerialLink> CaptureBackend for SerialBackend<L> {
    fn describe(&self) -> String {
        format!("serial {}", self.port)
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn read_one(&mut self) -> Result<Option<RawImage>, ReadError> {
        let link = self.link.as_mut().ok_or(ReadError::NotStarted)?;
        let mut extracted = self.framer.next_frame(&mut *link)?;

        // Once the header is known, finish the frame in this pull if the OS
        // already holds the rest of it.
        if matches!(extracted, Extracted::Pending) {
            if let Some(missing) = self.framer.shortfall().filter(|&n| n > 0) {
                let queued = link.bytes_to_read()? as usize;
                if queued >= missing {
                    self.framer.fill_exact_from(&mut *link, queued)?;
                    extracted = self.framer.extract();
                }
            }
        }

        let image = match extracted {
            Extracted::Frame(frame) => self.decode(frame),
            Extracted::Pending => None,
            Extracted::Rejected(corruption) => {
                debug!(port = %self.port, %corruption, "dropped serial frame");
                metrics::counter!("capture_framing_rejects_total").increment(1);
                None
            }
        };

        // Last, so the OS buffer had the whole read to refill.
        self.flush_if_backlogged()?;
        Ok(image)
    }

    fn close(&mut self) {
        if self.link.take().is_some() {
            info!(port = %self.port, "serial camera closed");
        }
        self.framer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::framer::{encode_frame, READ_CHUNK};
    use image::{codecs::jpeg::JpegEncoder, ExtendedColorType, RgbImage};
    use std::io::Cursor;

    struct FakeLink {
        data: Cursor<Vec<u8>>,
        queued: u32,
        discarded: usize,
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.data.read(buf)
        }
    }

    impl SerialLink for FakeLink {
        fn bytes_to_read(&self) -> io::Result<u32> {
            Ok(self.queued)
        }

        fn discard_input(&mut self) -> io::Result<()> {
            self.discarded += 1;
            self.queued = 0;
            Ok(())
        }
    }

    fn link(data: Vec<u8>, queued: u32) -> FakeLink {
        FakeLink {
            data: Cursor::new(data),
            queued,
            discarded: 0,
        }
    }

    fn jpeg_body() -> Vec<u8> {
        let source = RgbImage::from_pixel(8, 8, image::Rgb([10, 200, 10]));
        let mut encoded = Vec::new();
        JpegEncoder::new(&mut encoded)
            .encode(source.as_raw(), 8, 8, ExtendedColorType::Rgb8)
            .unwrap();
        assert_eq!(&encoded[encoded.len() - 2..], &[0xFF, 0xD9]);
        encoded
    }

    /// A valid JPEG grown to `total` bytes with a comment segment.
    fn padded_jpeg_body(total: usize) -> Vec<u8> {
        let body = jpeg_body();
        let pad = total - body.len();
        let mut out = body[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xFE]);
        out.extend_from_slice(&((pad - 2) as u16).to_be_bytes());
        out.extend(std::iter::repeat(b' ').take(pad - 4));
        out.extend_from_slice(&body[2..]);
        assert_eq!(out.len(), total);
        out
    }

    #[test]
    fn absent_port_is_not_an_error() {
        let opened = SerialBackend::open_if_present("/dev/ttyUSB9", &["/dev/ttyUSB0".into()]);
        assert!(matches!(opened, Ok(None)));
    }

    #[test]
    fn decodes_framed_jpeg() {
        let body = jpeg_body();
        let mut stream = encode_frame(&body, true);
        stream.push(0xFF);
        let byte_len = body.len();
        let mut backend = SerialBackend::with_link("COM7", link(stream, 0));

        let raw = backend.read_one().unwrap().expect("frame");
        assert_eq!(raw.image.dimensions(), (8, 8));
        assert_eq!(raw.byte_len, byte_len);
        assert!(matches!(raw.sequence, SequenceMarker::WallClock(_)));
    }

    #[test]
    fn undecodable_frame_is_dropped_not_fatal() {
        let mut body = vec![0x01; 38];
        body.extend_from_slice(&[0xFF, 0xD9]);
        let mut stream = encode_frame(&body, true);
        stream.push(0xFF);
        let mut backend = SerialBackend::with_link("COM7", link(stream, 0));
        assert!(backend.read_one().unwrap().is_none());
        assert!(backend.is_open());
    }

    #[test]
    fn backlog_flushes_port_and_accumulator() {
        let mut partial = encode_frame(&[0x02; 3000], true);
        partial.truncate(1000);
        let mut backend = SerialBackend::with_link("COM7", link(partial, BUFFER_SIZE));

        assert!(backend.read_one().unwrap().is_none());
        assert!(backend.framer().buffered().is_empty());
        assert_eq!(backend.link.as_ref().unwrap().discarded, 1);
    }

    #[test]
    fn queued_remainder_completes_frame_in_one_pull() {
        let body = padded_jpeg_body(4500);
        let mut stream = encode_frame(&body, true);
        stream.push(0xFF);
        let queued = (stream.len() - READ_CHUNK) as u32;
        let mut backend = SerialBackend::with_link("COM7", link(stream, queued));

        let raw = backend.read_one().unwrap().expect("frame in a single pull");
        assert_eq!(raw.image.dimensions(), (8, 8));
        assert_eq!(raw.byte_len, 4500);
        assert_eq!(backend.framer().buffered().len(), 2);
    }

    #[test]
    fn short_queue_leaves_frame_pending() {
        let body = padded_jpeg_body(4500);
        let mut stream = encode_frame(&body, true);
        stream.push(0xFF);
        let mut backend = SerialBackend::with_link("COM7", link(stream, 100));

        assert!(backend.read_one().unwrap().is_none());
        assert_eq!(backend.framer().buffered().len(), READ_CHUNK);
    }

    #[test]
    fn closed_backend_reports_not_started() {
        let mut backend = SerialBackend::with_link("COM7", link(Vec::new(), 0));
        backend.close();
        assert!(!backend.is_open());
        assert!(matches!(backend.read_one(), Err(ReadError::NotStarted)));
    }
}
