//! Still-image compression surface consumed by the core.
//!
//! Encoding and decoding are external collaborators; the core only needs
//! `encode(pixels) -> bytes` and `decode(bytes) -> pixels`. The default
//! implementation is baseline JPEG via the `image` crate.

use crate::error::{Error, Result};
use crate::frame::{Frame, PixelFormat};

/// Compresses a pixel buffer into a still image
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, frame: &Frame, quality: u8) -> Result<Vec<u8>>;
}

/// Decompresses a still image into a pixel buffer
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Frame>;
}

/// Baseline JPEG codec backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCodec;

impl ImageEncoder for JpegCodec {
    fn encode(&self, frame: &Frame, quality: u8) -> Result<Vec<u8>> {
        if frame.is_empty() {
            return Err(Error::Codec("empty frame".into()));
        }
        let color = match frame.format {
            PixelFormat::Rgb888 => image::ExtendedColorType::Rgb8,
            PixelFormat::Gray8 => image::ExtendedColorType::L8,
            PixelFormat::Rgba8888 => {
                return Err(Error::Codec("RGBA must be converted before encoding".into()))
            }
        };

        let mut out = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(&frame.pixels, frame.width, frame.height, color)?;
        Ok(out)
    }
}

impl ImageDecoder for JpegCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Frame> {
        let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Jpeg)?;
        let rgb = decoded.to_rgb8();
        let (width, height) = rgb.dimensions();
        Ok(Frame::new(width, height, PixelFormat::Rgb888, rgb.into_raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push((x * 255 / width.max(1)) as u8);
                pixels.push((y * 255 / height.max(1)) as u8);
                pixels.push(128);
            }
        }
        Frame::new(width, height, PixelFormat::Rgb888, pixels)
    }

    #[test]
    fn test_encode_decode_preserves_dimensions() {
        let codec = JpegCodec;
        let frame = gradient(176, 144);
        let jpeg = codec.encode(&frame, 80).expect("encode");
        assert!(!jpeg.is_empty());
        // JPEG magic
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = codec.decode(&jpeg).expect("decode");
        assert_eq!(decoded.width, 176);
        assert_eq!(decoded.height, 144);
        assert_eq!(decoded.format, PixelFormat::Rgb888);
    }

    #[test]
    fn test_grayscale_encode() {
        let codec = JpegCodec;
        let frame = Frame::new(64, 48, PixelFormat::Gray8, vec![200u8; 64 * 48]);
        let jpeg = codec.encode(&frame, 70).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_garbage_decode_fails() {
        let codec = JpegCodec;
        assert!(codec.decode(&[0x00, 0x01, 0x02, 0x03]).is_err());
    }

    #[test]
    fn test_empty_frame_encode_fails() {
        let codec = JpegCodec;
        assert!(codec.encode(&Frame::empty(), 80).is_err());
    }
}
