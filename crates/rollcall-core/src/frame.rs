//! Frame decoding, brightness measurement and low-light gamma correction.

use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;

/// Low-light correction settings.
#[derive(Debug, Clone, Copy)]
pub struct LowLight {
    /// Mean HSV value (0–255) below which a frame is brightened.
    pub brightness_threshold: f32,
    pub gamma: f32,
}

impl Default for LowLight {
    fn default() -> Self {
        Self {
            brightness_threshold: 40.0,
            gamma: 1.5,
        }
    }
}

/// A decoded frame ready to be handed to the extractor.
#[derive(Debug, Clone)]
pub struct PreparedFrame {
    pub width: u32,
    pub height: u32,
    /// Mean HSV value before any correction.
    pub brightness: f32,
    /// Re-encoded PNG when gamma correction was applied, otherwise `None`
    /// and the original bytes should be used unchanged.
    pub enhanced: Option<Vec<u8>>,
}

impl PreparedFrame {
    /// Bytes to send to the extractor.
    pub fn payload<'a>(&'a self, original: &'a [u8]) -> &'a [u8] {
        self.enhanced.as_deref().unwrap_or(original)
    }
}

/// Average of the per-pixel max channel (the V in HSV), 0.0–255.0.
pub fn mean_value_brightness(rgb: &RgbImage) -> f32 {
    let pixels = (rgb.width() as u64) * (rgb.height() as u64);
    if pixels == 0 {
        return 0.0;
    }
    let total: u64 = rgb
        .pixels()
        .map(|p| p.0.iter().copied().max().unwrap_or(0) as u64)
        .sum();
    total as f32 / pixels as f32
}

/// 256-entry lookup table for `out = 255 * (in / 255) ^ (1 / gamma)`.
///
/// Values are truncated, so 0 and 255 map to themselves.
pub fn gamma_lut(gamma: f32) -> [u8; 256] {
    let inv_gamma = 1.0 / gamma as f64;
    let mut lut = [0u8; 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        let v = (i as f64 / 255.0).powf(inv_gamma) * 255.0;
        *slot = v.clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Apply a lookup table to every channel of every pixel in place.
pub fn apply_lut(rgb: &mut RgbImage, lut: &[u8; 256]) {
    for pixel in rgb.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = lut[*c as usize];
        }
    }
}

/// Decode `bytes`, measure brightness and brighten the frame if it is too dark.
pub fn prepare(bytes: &[u8], low_light: &LowLight) -> Result<PreparedFrame, FrameError> {
    let img = image::load_from_memory(bytes).map_err(|e| FrameError::Decode(e.to_string()))?;
    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(FrameError::Empty);
    }

    let mut rgb = img.to_rgb8();
    let brightness = mean_value_brightness(&rgb);

    if brightness >= low_light.brightness_threshold {
        return Ok(PreparedFrame {
            width,
            height,
            brightness,
            enhanced: None,
        });
    }

    tracing::debug!(brightness, gamma = low_light.gamma, "low light, applying gamma correction");
    apply_lut(&mut rgb, &gamma_lut(low_light.gamma));

    let mut encoded = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|e| FrameError::Encode(e.to_string()))?;

    Ok(PreparedFrame {
        width,
        height,
        brightness,
        enhanced: Some(encoded),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("could not decode image: {0}")]
    Decode(String),
    #[error("image has zero width or height")]
    Empty,
    #[error("could not re-encode corrected image: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn png_of(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([value, value / 2, value / 4]));
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn test_gamma_lut_endpoints_and_brightening() {
        let lut = gamma_lut(1.5);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        // Gamma > 1 lifts the mid-tones.
        assert!(lut[64] > 64);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_brightness_uses_max_channel() {
        let img = RgbImage::from_pixel(4, 4, Rgb([10, 200, 30]));
        assert!((mean_value_brightness(&img) - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_bright_frame_untouched() {
        let bytes = png_of(8, 6, 180);
        let frame = prepare(&bytes, &LowLight::default()).unwrap();
        assert_eq!((frame.width, frame.height), (8, 6));
        assert!(frame.enhanced.is_none());
        assert_eq!(frame.payload(&bytes), bytes.as_slice());
    }

    #[test]
    fn test_prepare_dark_frame_enhanced() {
        let bytes = png_of(8, 8, 20);
        let frame = prepare(&bytes, &LowLight::default()).unwrap();
        assert!(frame.brightness < 40.0);
        let enhanced = frame.enhanced.as_ref().expect("dark frame should be corrected");

        let decoded = image::load_from_memory(enhanced).unwrap().to_rgb8();
        assert!(mean_value_brightness(&decoded) > frame.brightness);
    }

    #[test]
    fn test_prepare_rejects_garbage() {
        let result = prepare(b"definitely not an image", &LowLight::default());
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
