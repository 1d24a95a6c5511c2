//! Resolution cap applied to every frame before hand-off.

use image::imageops::{self, FilterType};
use image::RgbImage;

/// Largest spatial dimension handed downstream.
pub const MAX_RESOLUTION: u32 = 600;

#[derive(Debug, Clone, Copy)]
pub struct ResolutionNormalizer {
    max_dimension: u32,
}

impl ResolutionNormalizer {
    pub fn new(max_dimension: u32) -> Self {
        Self {
            max_dimension: max_dimension.max(1),
        }
    }

    /// Output size for an input of `width` x `height`. Never upscales.
    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        let largest = width.max(height);
        if largest <= self.max_dimension {
            return (width, height);
        }
        let scale = self.max_dimension as f64 / largest as f64;
        let scaled = |v: u32| ((v as f64 * scale) as u32).max(1);
        (scaled(width), scaled(height))
    }

    pub fn normalize(&self, image: RgbImage) -> RgbImage {
        let (width, height) = image.dimensions();
        let (target_w, target_h) = self.target_size(width, height);
        if (target_w, target_h) == (width, height) {
            return image;
        }
        imageops::resize(&image, target_w, target_h, FilterType::Triangle)
    }
}

impl Default for ResolutionNormalizer {
    fn default() -> Self {
        Self::new(MAX_RESOLUTION)
    }
}
