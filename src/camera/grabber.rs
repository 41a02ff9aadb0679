//! Frame grabber: the first stage of the camera pipeline.
//!
//! Accepts raw driver frames, normalizes the pixel format, applies the
//! configured shrink ratio (bilinear) and optional BT.601 grayscale, and
//! emits the result synchronously. Driver buffers are copied into
//! grabber-owned storage immediately; the emitted frame is a borrow of
//! that storage, so nothing downstream can retain driver memory.
//!
//! Buffers are reused across frames: after warm-up the common path
//! performs no allocation, including the pass-through case
//! (ratio == 1, grayscale off).

use crate::frame::{rgb_to_luma, scale_bilinear, Frame, PixelFormat, RawFrame};

/// Smallest output the shrink ratio may produce
const MIN_OUTPUT_WIDTH: u32 = 160;
const MIN_OUTPUT_HEIGHT: u32 = 120;

pub struct FrameGrabber {
    enabled: bool,
    shrink_ratio: f32,
    grayscale: bool,
    // Reused pipeline buffers
    normalized: Frame,
    scaled: Vec<u8>,
    luma: Vec<u8>,
    out: Frame,
}

impl FrameGrabber {
    pub fn new() -> Self {
        Self {
            enabled: false,
            shrink_ratio: 1.0,
            grayscale: false,
            normalized: Frame::empty(),
            scaled: Vec::new(),
            luma: Vec::new(),
            out: Frame::empty(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn shrink_ratio(&self) -> f32 {
        self.shrink_ratio
    }

    pub fn is_grayscale(&self) -> bool {
        self.grayscale
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Set the output-to-input linear dimension ratio. Values above 1 are
    /// clamped to 1; non-positive or non-finite values are rejected.
    pub fn set_shrink_ratio(&mut self, ratio: f32) {
        if !ratio.is_finite() || ratio <= 0.0 {
            log::warn!("Ignoring invalid shrink ratio {}", ratio);
            return;
        }
        self.shrink_ratio = ratio.min(1.0);
    }

    pub fn set_grayscale(&mut self, grayscale: bool) {
        self.grayscale = grayscale;
    }

    /// Run one raw frame through the pipeline. `emit` is called at most
    /// once, synchronously, with the processed frame.
    pub fn process<F: FnOnce(&Frame)>(&mut self, raw: &RawFrame<'_>, emit: F) {
        if !self.enabled {
            return;
        }
        if raw.width == 0 || raw.height == 0 || raw.pixels.is_empty() {
            // Zero-sized frames are dropped silently
            return;
        }

        self.normalize(raw);

        let (src_w, src_h) = (self.normalized.width, self.normalized.height);
        let (dst_w, dst_h) = self.target_dimensions(src_w, src_h);
        let channels = self.normalized.channels();

        let want_luma = self.grayscale && self.normalized.format == PixelFormat::Rgb888;

        if (dst_w, dst_h) == (src_w, src_h) && !want_luma {
            // Pass-through: the normalized copy is the output
            emit(&self.normalized);
            return;
        }

        let scaled: &[u8] = if (dst_w, dst_h) == (src_w, src_h) {
            &self.normalized.pixels
        } else {
            scale_bilinear(
                &self.normalized.pixels,
                src_w,
                src_h,
                channels,
                dst_w,
                dst_h,
                &mut self.scaled,
            );
            &self.scaled
        };

        if want_luma {
            rgb_to_luma(scaled, &mut self.luma);
            self.out.width = dst_w;
            self.out.height = dst_h;
            self.out.format = PixelFormat::Gray8;
            self.out.pixels.clear();
            self.out.pixels.extend_from_slice(&self.luma);
        } else {
            self.out.width = dst_w;
            self.out.height = dst_h;
            self.out.format = self.normalized.format;
            self.out.pixels.clear();
            self.out.pixels.extend_from_slice(scaled);
        }
        emit(&self.out);
    }

    /// Copy the driver buffer into owned storage, converting anything that
    /// is not RGB888 or Gray8 and dropping row padding.
    fn normalize(&mut self, raw: &RawFrame<'_>) {
        let width = raw.width as usize;
        let height = raw.height as usize;
        let src_bpp = raw.format.bytes_per_pixel();
        let row_bytes = width * src_bpp;

        let target_format = match raw.format {
            PixelFormat::Gray8 => PixelFormat::Gray8,
            _ => PixelFormat::Rgb888,
        };
        let dst_bpp = target_format.bytes_per_pixel();

        self.normalized.width = raw.width;
        self.normalized.height = raw.height;
        self.normalized.format = target_format;
        self.normalized.pixels.clear();
        self.normalized.pixels.reserve(width * height * dst_bpp);

        for y in 0..height {
            let start = y * raw.stride;
            let Some(row) = raw.pixels.get(start..start + row_bytes) else {
                // Driver handed us less data than advertised; keep what we
                // copied so far and stop
                break;
            };
            match raw.format {
                PixelFormat::Rgb888 | PixelFormat::Gray8 => {
                    self.normalized.pixels.extend_from_slice(row);
                }
                PixelFormat::Rgba8888 => {
                    for px in row.chunks_exact(4) {
                        self.normalized.pixels.extend_from_slice(&px[..3]);
                    }
                }
            }
        }

        let copied_rows = self.normalized.pixels.len() / (width * dst_bpp).max(1);
        self.normalized.height = copied_rows as u32;
    }

    /// Apply the shrink ratio and the 160x120 floor. The floor never
    /// upscales: sources already smaller than it pass unchanged.
    fn target_dimensions(&self, src_w: u32, src_h: u32) -> (u32, u32) {
        let mut w = ((src_w as f32 * self.shrink_ratio) + 0.5) as u32;
        let mut h = ((src_h as f32 * self.shrink_ratio) + 0.5) as u32;
        w = w.max(MIN_OUTPUT_WIDTH.min(src_w));
        h = h.max(MIN_OUTPUT_HEIGHT.min(src_h));
        (w.min(src_w), h.min(src_h))
    }
}

impl Default for FrameGrabber {
    fn default() -> Self {
        Self::new()
    }
}
