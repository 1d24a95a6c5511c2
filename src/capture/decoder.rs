use image::RgbImage;
use jpeg_decoder::{Decoder, PixelFormat as JpegPixelFormat};

use super::frame::PixelFormat;
use crate::error::FrameDecodeError;

/// Decode one captured buffer into an RGB image.
pub fn decode_frame(
    data: &[u8],
    format: PixelFormat,
    width: u32,
    height: u32,
) -> Result<RgbImage, FrameDecodeError> {
    match format {
        PixelFormat::Mjpeg => decode_jpeg(data),
        PixelFormat::Rgb24 => {
            let expected = width as usize * height as usize * 3;
            let pixels = data.get(..expected).ok_or(FrameDecodeError::SizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            })?;
            RgbImage::from_raw(width, height, pixels.to_vec()).ok_or(
                FrameDecodeError::SizeMismatch {
                    width,
                    height,
                    expected,
                    actual: data.len(),
                },
            )
        }
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height),
    }
}

pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, FrameDecodeError> {
    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode()?;
    let info = decoder.info().ok_or(FrameDecodeError::MissingInfo)?;
    let (width, height) = (info.width as u32, info.height as u32);

    let rgb = match info.pixel_format {
        JpegPixelFormat::RGB24 => pixels,
        JpegPixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => return Err(FrameDecodeError::UnsupportedFormat(format!("{other:?}"))),
    };
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameDecodeError::SizeMismatch {
        width,
        height,
        expected: width as usize * height as usize * 3,
        actual,
    })
}

/// Packed YUYV 4:2:2 (BT.601) to RGB24.
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameDecodeError> {
    let pixel_count = width as usize * height as usize;
    let expected = pixel_count * 2;
    if data.len() < expected || width % 2 != 0 {
        return Err(FrameDecodeError::SizeMismatch {
            width,
            height,
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_pixel(y0, u, v));
        rgb.extend_from_slice(&yuv_pixel(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameDecodeError::SizeMismatch {
        width,
        height,
        expected,
        actual: data.len(),
    })
}

fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{codecs::jpeg::JpegEncoder, ExtendedColorType};

    #[test]
    fn decodes_encoded_jpeg() {
        let source = RgbImage::from_pixel(16, 8, image::Rgb([200, 40, 40]));
        let mut encoded = Vec::new();
        JpegEncoder::new_with_quality(&mut encoded, 90)
            .encode(source.as_raw(), 16, 8, ExtendedColorType::Rgb8)
            .unwrap();

        let decoded = decode_jpeg(&encoded).unwrap();
        assert_eq!(decoded.dimensions(), (16, 8));
        let px = decoded.get_pixel(4, 4);
        assert!(px[0] > 150 && px[1] < 90, "{px:?}");
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(decode_jpeg(&[0x00, 0x01, 0x02, 0xFF, 0xD9]).is_err());
    }

    #[test]
    fn yuyv_white_and_black() {
        let data = [235, 128, 16, 128];
        let image = yuyv_to_rgb(&data, 2, 1).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
        assert!(yuyv_to_rgb(&data, 4, 1).is_err());
    }
}
