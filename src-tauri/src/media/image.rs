//! Frame processing utilities.
//!
//! This module provides functions for scaling captured frames, encoding them
//! as JPEG blobs for the upstream session and the UI preview, and generating
//! a placeholder image for when no frame is available.

use image::RgbImage;

/// JPEG quality for encoded frames (0-100).
const JPEG_QUALITY: u8 = 75;

/// Calculate scaled dimensions that fit within max bounds while preserving
/// aspect ratio. Never upscales.
pub fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (max_width, max_height);
    }

    let width_ratio = max_width as f64 / width as f64;
    let height_ratio = max_height as f64 / height as f64;
    let scale = width_ratio.min(height_ratio).min(1.0);

    let scaled_width = ((width as f64) * scale).round() as u32;
    let scaled_height = ((height as f64) * scale).round() as u32;

    // Ensure at least 1 pixel in each dimension
    (scaled_width.max(1), scaled_height.max(1))
}

/// Resize an RGB image to fit within the given bounding box, preserving
/// aspect ratio. Returns the input unchanged (cloned) when it already fits.
pub fn resize_to_fit(img: &RgbImage, max_width: u32, max_height: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    let (scaled_width, scaled_height) = fit_dimensions(width, height, max_width, max_height);
    if (scaled_width, scaled_height) == (width, height) {
        return img.clone();
    }
    image::imageops::resize(
        img,
        scaled_width,
        scaled_height,
        image::imageops::FilterType::Triangle,
    )
}

/// Encode an RGB image as a JPEG blob.
pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, String> {
    let mut jpeg_bytes: Vec<u8> = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg_bytes, JPEG_QUALITY);
    encoder
        .encode_image(img)
        .map_err(|e| format!("Failed to encode JPEG: {}", e))?;
    Ok(jpeg_bytes)
}

/// Build an RGB image from raw interleaved RGB24 pixel data.
pub fn rgb_from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage, String> {
    if data.len() < (width * height * 3) as usize {
        return Err(format!(
            "Buffer too small: expected {} bytes, got {}",
            width * height * 3,
            data.len()
        ));
    }
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| "Failed to create image buffer".to_string())
}

/// Generate a blank (black) placeholder image.
///
/// `shape` is [height, width, channels]; only the first two components are
/// used, the pixel format is always RGB.
pub fn blank_image(shape: [u32; 3]) -> RgbImage {
    let [height, width, _channels] = shape;
    RgbImage::new(width.max(1), height.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_dimensions_landscape() {
        // 2048x1536 -> max 1024x1024
        let (w, h) = fit_dimensions(2048, 1536, 1024, 1024);
        assert_eq!(w, 1024);
        assert_eq!(h, 768);
    }

    #[test]
    fn test_fit_dimensions_portrait() {
        // 1080x1920 -> max 320x180
        let (w, h) = fit_dimensions(1080, 1920, 320, 180);
        assert_eq!(w, 101); // Limited by height
        assert_eq!(h, 180);
    }

    #[test]
    fn test_fit_dimensions_no_upscale() {
        // 100x50 -> max 320x180 (should not upscale)
        let (w, h) = fit_dimensions(100, 50, 320, 180);
        assert_eq!(w, 100);
        assert_eq!(h, 50);
    }

    #[test]
    fn test_resize_preserves_aspect_ratio() {
        let img = RgbImage::new(2048, 1536);
        let resized = resize_to_fit(&img, 1024, 1024);
        assert_eq!(resized.dimensions(), (1024, 768));
    }

    #[test]
    fn test_resize_is_idempotent_for_same_bounds() {
        let img = RgbImage::new(1600, 900);
        let once = resize_to_fit(&img, 640, 640);
        let twice = resize_to_fit(&once, 640, 640);
        assert_eq!(once.dimensions(), twice.dimensions());
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let img = RgbImage::from_pixel(16, 16, image::Rgb([0, 128, 255]));
        let bytes = encode_jpeg(&img).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]); // JPEG SOI marker
    }

    #[test]
    fn test_blank_image_dimensions() {
        let img = blank_image([480, 640, 3]);
        assert_eq!(img.dimensions(), (640, 480));
        assert_eq!(img.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_rgb_from_raw_rejects_short_buffer() {
        let err = rgb_from_raw(10, 10, vec![0u8; 10]).unwrap_err();
        assert!(err.contains("Buffer too small"));
    }

    #[test]
    fn test_rgb_from_raw_roundtrip() {
        let data = vec![7u8; 4 * 4 * 3];
        let img = rgb_from_raw(4, 4, data).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(2, 2).0, [7, 7, 7]);
    }
}
