//! Pixel buffer model and the transforms applied before encoding.
//!
//! The OS camera driver owns its buffers only for the duration of a
//! callback, so [`RawFrame`] borrows pixel data while [`Frame`] always owns
//! its storage. Nothing past the grabber boundary ever holds a reference to
//! driver memory.

use std::time::Instant;

/// Pixel layouts accepted from camera drivers.
///
/// Anything other than `Rgb888`/`Gray8` is converted to RGB888 before any
/// further processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 3 bytes per pixel, R G B
    Rgb888,
    /// 4 bytes per pixel, R G B A (alpha dropped on conversion)
    Rgba8888,
    /// 1 byte per pixel, luminance
    Gray8,
}

impl PixelFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Gray8 => 1,
        }
    }
}

/// A decoded frame as handed over by the camera driver.
///
/// `stride` is the byte distance between rows and may exceed
/// `width * bytes_per_pixel` for padded buffers.
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub format: PixelFormat,
    pub captured_at: Instant,
    pub pixels: &'a [u8],
}

/// An owned pixel buffer flowing through the pipeline.
///
/// Only `Rgb888` and `Gray8` appear past the grabber.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub pixels: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, format: PixelFormat, pixels: Vec<u8>) -> Self {
        debug_assert_eq!(
            pixels.len(),
            width as usize * height as usize * format.bytes_per_pixel()
        );
        Self {
            width,
            height,
            format,
            pixels,
        }
    }

    /// An empty placeholder frame
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Gray8,
            pixels: Vec::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.pixels.is_empty()
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.format.bytes_per_pixel()
    }
}

/// Bilinear-sample `src` (tightly packed, `channels` bytes per pixel) into
/// `out`, producing a `dst_w` x `dst_h` buffer.
///
/// `out` is cleared and reused; steady-state callers pay no allocation once
/// its capacity has grown to the output size.
pub fn scale_bilinear(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    channels: usize,
    dst_w: u32,
    dst_h: u32,
    out: &mut Vec<u8>,
) {
    out.clear();
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return;
    }
    out.reserve(dst_w as usize * dst_h as usize * channels);

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;
    let row = src_w as usize * channels;

    for dy in 0..dst_h {
        // Sample at pixel centres so a 1:1 scale is the identity
        let sy = ((dy as f32 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = sy as usize;
        let y1 = (y0 + 1).min(src_h as usize - 1);
        let fy = sy - y0 as f32;

        for dx in 0..dst_w {
            let sx = ((dx as f32 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = sx as usize;
            let x1 = (x0 + 1).min(src_w as usize - 1);
            let fx = sx - x0 as f32;

            let p00 = y0 * row + x0 * channels;
            let p01 = y0 * row + x1 * channels;
            let p10 = y1 * row + x0 * channels;
            let p11 = y1 * row + x1 * channels;

            for c in 0..channels {
                let top = src[p00 + c] as f32 * (1.0 - fx) + src[p01 + c] as f32 * fx;
                let bottom = src[p10 + c] as f32 * (1.0 - fx) + src[p11 + c] as f32 * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                out.push((value + 0.5) as u8);
            }
        }
    }
}

/// Convert a tightly packed RGB888 buffer to single-channel luminance using
/// the ITU-R BT.601 weights (Y = 0.299 R + 0.587 G + 0.114 B).
pub fn rgb_to_luma(rgb: &[u8], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(rgb.len() / 3);
    for px in rgb.chunks_exact(3) {
        // Fixed-point BT.601, scaled by 1000
        let y = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32 + 500) / 1000;
        out.push(y.min(255) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_scale() {
        let src = vec![10u8, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120];
        let mut out = Vec::new();
        scale_bilinear(&src, 2, 2, 3, 2, 2, &mut out);
        assert_eq!(out, src);
    }

    #[test]
    fn test_downscale_averages() {
        // 2x2 gray block down to 1x1 samples the centre of all four pixels
        let src = vec![0u8, 100, 100, 200];
        let mut out = Vec::new();
        scale_bilinear(&src, 2, 2, 1, 1, 1, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], 100);
    }

    #[test]
    fn test_downscale_dimensions() {
        let src = vec![128u8; 640 * 480 * 3];
        let mut out = Vec::new();
        scale_bilinear(&src, 640, 480, 3, 320, 240, &mut out);
        assert_eq!(out.len(), 320 * 240 * 3);
        assert!(out.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_luma_weights() {
        let mut out = Vec::new();
        rgb_to_luma(&[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255], &mut out);
        // 0.299 / 0.587 / 0.114 of 255, rounded
        assert_eq!(out, vec![76, 150, 29, 255]);
    }

    #[test]
    fn test_zero_sized_scale() {
        let mut out = vec![1u8, 2, 3];
        scale_bilinear(&[], 0, 0, 3, 10, 10, &mut out);
        assert!(out.is_empty());
    }
}
