use std::io::{self, Cursor, Read};
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};

use framesource::capture::framer::{encode_frame, frame_checksum, HEADER};
use framesource::capture::serial::SerialLink;
use framesource::capture::{
    CaptureBackend, CaptureStateMachine, Connector, Extracted, FrameFramer, SerialBackend, Tick,
    Timing,
};
use framesource::{
    CancellationSignal, CaptureSourceConfig, FramingCorruption, HandoffQueue, OpenError,
    RequestToken, SourceHandle, UsbBackend,
};

/// Hands out at most `chunk` bytes per read, like a slow UART.
struct Trickle {
    data: Cursor<Vec<u8>>,
    chunk: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.chunk);
        self.data.read(&mut buf[..n])
    }
}

impl SerialLink for Trickle {
    fn bytes_to_read(&self) -> io::Result<u32> {
        let remaining = self.data.get_ref().len() as u64 - self.data.position();
        Ok(remaining as u32)
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let end = self.data.get_ref().len() as u64;
        self.data.set_position(end);
        Ok(())
    }
}

/// Image-shaped bytes: SOI, filler clear of 0xFF, EOI.
fn image_bytes(seed: u8, len: usize) -> Vec<u8> {
    let mut out = vec![0xFF, 0xD8];
    out.extend((0..len - 4).map(|i| (i as u8 ^ seed) % 0xF0));
    out.extend_from_slice(&[0xFF, 0xD9]);
    out
}

fn drain(framer: &mut FrameFramer, link: &mut Trickle) -> (Vec<Vec<u8>>, Vec<FramingCorruption>) {
    let mut frames = Vec::new();
    let mut rejects = Vec::new();
    for _ in 0..10_000 {
        match framer.next_frame(link).unwrap() {
            Extracted::Frame(frame) => frames.push(frame.jpeg().to_vec()),
            Extracted::Rejected(why) => rejects.push(why),
            Extracted::Pending => {
                if link.data.position() as usize == link.data.get_ref().len() {
                    break;
                }
            }
        }
    }
    (frames, rejects)
}

#[test]
fn mixed_stream_yields_only_valid_frames() {
    let first = image_bytes(1, 200);
    let legacy = image_bytes(2, 150);
    let last = image_bytes(3, 220);
    let damaged = image_bytes(4, 120);

    let mut stream = vec![0x12, 0x34, 0xFF, 0x00];
    stream.extend(encode_frame(&first, true));

    let mut bad_crc = encode_frame(&damaged, true);
    let good = *bad_crc.last().unwrap();
    let wrong = good ^ 1;
    *bad_crc.last_mut().unwrap() = wrong;
    stream.extend(&bad_crc);

    // No checksum: the next header follows the image directly.
    stream.extend(encode_frame(&legacy, false));

    let mut bad_eoi = encode_frame(&image_bytes(5, 90), true);
    let eoi_last = bad_eoi.len() - 2;
    bad_eoi[eoi_last] = 0xD8;
    stream.extend(&bad_eoi);

    stream.extend(encode_frame(&last, true));
    stream.push(0x00);

    let mut link = Trickle {
        data: Cursor::new(stream),
        chunk: 37,
    };
    let mut framer = FrameFramer::new();
    let (frames, rejects) = drain(&mut framer, &mut link);

    assert_eq!(frames, vec![first, legacy, last]);
    assert_eq!(
        rejects,
        vec![
            FramingCorruption::ChecksumMismatch {
                computed: frame_checksum(&damaged),
                received: wrong,
            },
            FramingCorruption::MissingEndMarker { found: [0xFF, 0xD8] },
        ]
    );
}

#[test]
fn frame_split_across_many_reads_is_reassembled() {
    let body = image_bytes(9, 1500);
    let mut stream = encode_frame(&body, true);
    stream.push(0x00);
    let mut link = Trickle {
        data: Cursor::new(stream),
        chunk: 5,
    };
    let mut framer = FrameFramer::new();
    let (frames, rejects) = drain(&mut framer, &mut link);
    assert_eq!(frames, vec![body]);
    assert!(rejects.is_empty());
}

fn jpeg_body(color: [u8; 3]) -> Vec<u8> {
    let source = RgbImage::from_pixel(16, 16, Rgb(color));
    let mut encoded = Vec::new();
    JpegEncoder::new(&mut encoded)
        .encode(source.as_raw(), 16, 16, ExtendedColorType::Rgb8)
        .unwrap();
    encoded
}

struct SerialCamera {
    stream: Option<Vec<u8>>,
}

impl Connector for SerialCamera {
    fn open(
        &mut self,
        config: &CaptureSourceConfig,
    ) -> Result<Option<Box<dyn CaptureBackend>>, OpenError> {
        Ok(self.stream.take().map(|bytes| {
            let link = Trickle {
                data: Cursor::new(bytes),
                chunk: 512,
            };
            Box::new(SerialBackend::with_link(config.source.clone(), link))
                as Box<dyn CaptureBackend>
        }))
    }
}

#[test]
fn serial_camera_delivers_after_warm_up() {
    let mut stream = Vec::new();
    stream.extend(encode_frame(&jpeg_body([255, 0, 0]), true));
    stream.extend(encode_frame(&jpeg_body([0, 0, 255]), false));
    stream.extend_from_slice(&HEADER);

    let (queue, consumer) = HandoffQueue::channel();
    let request = RequestToken::new();
    let mut machine = CaptureStateMachine::new(
        SerialCamera {
            stream: Some(stream),
        },
        SourceHandle::new(Some(CaptureSourceConfig::new(
            "/dev/ttyACM0",
            UsbBackend::V4l2,
        ))),
        queue,
        request.clone(),
        CancellationSignal::new(),
    )
    .with_timing(Timing {
        idle_poll: Duration::from_millis(1),
        request_poll: Duration::from_millis(1),
        reconnect_backoff: Duration::ZERO,
    });
    request.request();

    let mut ticks = Vec::new();
    for _ in 0..100 {
        let tick = machine.tick();
        ticks.push(tick);
        if tick == Tick::Delivered {
            break;
        }
    }
    assert!(ticks.contains(&Tick::WarmedUp), "{ticks:?}");
    assert_eq!(ticks.last(), Some(&Tick::Delivered), "{ticks:?}");

    // Only the second frame (blue) reaches the consumer.
    let frame = consumer.pop().expect("frame");
    assert_eq!(frame.image.dimensions(), (16, 16));
    let pixel = frame.image.get_pixel(8, 8);
    assert!(pixel[2] > 200 && pixel[0] < 60, "{pixel:?}");
    assert!(frame.fps >= 0.0);
    assert!(consumer.pop().is_none());
}
