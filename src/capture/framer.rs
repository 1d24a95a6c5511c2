//! Recovers JPEG frames from the serial camera byte stream.
//!
//! Wire layout of one frame:
//!
//! ```text
//! FF A0 FF A1 | len (u16 LE) | jpeg (len bytes, ends in FF D9) | checksum
//! ```
//!
//! The checksum is the inverted CRC-8/ROHC of the jpeg bytes. Older firmware
//! sends no checksum: the next header follows the jpeg directly, so the two
//! bytes after the image read [`LEGACY_SLOT`].

use std::io::{self, Read};

use bytes::{Buf, Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::error::FramingCorruption;

/// Frame start marker.
pub const HEADER: [u8; 4] = [0xFF, 0xA0, 0xFF, 0xA1];
/// Magic markers plus the length field.
pub const HEADER_LEN: usize = 6;
/// JPEG end-of-image marker, the last two bytes of every image.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
/// Bytes after the image on firmware without CRC support: the next header.
pub const LEGACY_SLOT: [u8; 2] = [HEADER[0], HEADER[1]];
/// Bytes pulled from the port per read.
pub const READ_CHUNK: usize = 2048;

// Bytes past the image that must be buffered before a frame can be judged.
const SLOT_LEN: usize = LEGACY_SLOT.len();
// Most frames are a little over 4 KiB; start low so skip-ahead engages early.
const INITIAL_SP_MAX: usize = 2560;
const SKIP_AHEAD_RATIO: f64 = 2.3;

static ROHC_TABLE: Lazy<[u8; 256]> = Lazy::new(|| {
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        let mut crc = i as u8;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
        }
        *slot = crc;
    }
    table
});

/// CRC-8/ROHC: poly 0x07, init 0xFF, reflected, no final xor.
pub fn crc8_rohc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0xFF, |crc, &byte| ROHC_TABLE[(crc ^ byte) as usize])
}

/// Value the firmware writes after `jpeg`.
pub fn frame_checksum(jpeg: &[u8]) -> u8 {
    !crc8_rohc(jpeg)
}

/// Serialize one frame the way the camera firmware does.
///
/// `jpeg` must be a complete image, end marker included. Without a checksum
/// the frame is only complete on the wire once the next header follows it.
pub fn encode_frame(jpeg: &[u8], with_checksum: bool) -> Vec<u8> {
    let len = u16::try_from(jpeg.len()).unwrap_or(u16::MAX);
    let jpeg = &jpeg[..len as usize];
    let mut out = Vec::with_capacity(HEADER_LEN + jpeg.len() + 1);
    out.extend_from_slice(&HEADER);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(jpeg);
    if with_checksum {
        out.push(frame_checksum(jpeg));
    }
    out
}

/// A validated frame: one complete JPEG image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialFrame {
    jpeg: Bytes,
}

impl SerialFrame {
    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    pub fn into_jpeg(self) -> Bytes {
        self.jpeg
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted {
    Frame(SerialFrame),
    /// Not enough bytes for a whole frame yet.
    Pending,
    /// Candidate failed validation and was dropped from the buffer.
    Rejected(FramingCorruption),
}

/// Stateful parser over a growing byte accumulator.
///
/// Bytes before the current header are discarded as they are scanned past;
/// the front of the buffer is trimmed in place on every extraction.
#[derive(Debug)]
pub struct FrameFramer {
    buffer: BytesMut,
    sp_max: usize,
}

impl FrameFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4 * READ_CHUNK),
            sp_max: INITIAL_SP_MAX,
        }
    }

    /// Read up to [`READ_CHUNK`] bytes from `reader` into the accumulator.
    ///
    /// A read timeout counts as zero bytes.
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        self.read_into(reader, READ_CHUNK)
    }

    /// Read until `wanted` more bytes are buffered or the reader runs dry.
    pub fn fill_exact_from<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        wanted: usize,
    ) -> io::Result<usize> {
        let mut total = 0;
        while total < wanted {
            match self.read_into(reader, wanted - total)? {
                0 => break,
                n => total += n,
            }
        }
        Ok(total)
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Read once from `reader`, then try to extract a frame.
    pub fn next_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Extracted> {
        self.fill_from(reader)?;
        Ok(self.extract())
    }

    /// Try to extract one frame from what is buffered.
    pub fn extract(&mut self) -> Extracted {
        if self.buffer.len() < HEADER_LEN {
            return Extracted::Pending;
        }

        // Under backlog, jump to the newest header and let older frames go.
        let backlogged = self.buffer.len() as f64 > self.sp_max as f64 * SKIP_AHEAD_RATIO;
        let found = if backlogged {
            rfind_header(&self.buffer)
        } else {
            find_header(&self.buffer)
        };
        let Some(start) = found else {
            // Only a header split across reads can still match.
            let keep = HEADER.len() - 1;
            let stale = self.buffer.len().saturating_sub(keep);
            self.buffer.advance(stale);
            return Extracted::Pending;
        };
        self.buffer.advance(start);
        if self.buffer.len() < HEADER_LEN {
            return Extracted::Pending;
        }

        let jpeg_end = HEADER_LEN + self.jpeg_len();
        let frame_len = jpeg_end + SLOT_LEN;
        if self.buffer.len() < frame_len {
            self.track_frame_len(frame_len);
            return Extracted::Pending;
        }

        let found = [self.buffer[jpeg_end - 2], self.buffer[jpeg_end - 1]];
        if found != JPEG_EOI {
            self.track_frame_len(frame_len);
            // The length field cannot be trusted; resume scanning after the marker.
            self.buffer.advance(HEADER.len());
            return Extracted::Rejected(FramingCorruption::MissingEndMarker { found });
        }

        let slot = [self.buffer[jpeg_end], self.buffer[jpeg_end + 1]];
        if slot != LEGACY_SLOT {
            let received = slot[0];
            let computed = frame_checksum(&self.buffer[HEADER_LEN..jpeg_end]);
            if computed != received {
                self.buffer.advance(jpeg_end);
                return Extracted::Rejected(FramingCorruption::ChecksumMismatch {
                    computed,
                    received,
                });
            }
        }

        self.track_frame_len(frame_len);
        let mut frame = self.buffer.split_to(jpeg_end);
        frame.advance(HEADER_LEN);
        Extracted::Frame(SerialFrame {
            jpeg: frame.freeze(),
        })
    }

    /// Bytes still missing for the frame whose header sits at the front of
    /// the buffer, or `None` when no header has been located yet.
    pub fn shortfall(&self) -> Option<usize> {
        if self.buffer.len() < HEADER_LEN || self.buffer[..HEADER.len()] != HEADER {
            return None;
        }
        let frame_len = HEADER_LEN + self.jpeg_len() + SLOT_LEN;
        Some(frame_len.saturating_sub(self.buffer.len()))
    }

    /// Drop everything buffered. The frame-size high-water mark is kept.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Largest frame length observed so far.
    pub fn sp_max(&self) -> usize {
        self.sp_max
    }

    fn jpeg_len(&self) -> usize {
        u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize
    }

    fn read_into<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let start = self.buffer.len();
        self.buffer.resize(start + max, 0);
        match reader.read(&mut self.buffer[start..]) {
            Ok(n) => {
                self.buffer.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buffer.truncate(start);
                match e.kind() {
                    io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::Interrupted => Ok(0),
                    _ => Err(e),
                }
            }
        }
    }

    fn track_frame_len(&mut self, frame_len: usize) {
        self.sp_max = self.sp_max.max(frame_len);
    }
}

impl Default for FrameFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn find_header(data: &[u8]) -> Option<usize> {
    data.windows(HEADER.len()).position(|w| w == HEADER)
}

fn rfind_header(data: &[u8]) -> Option<usize> {
    data.windows(HEADER.len()).rposition(|w| w == HEADER)
}
