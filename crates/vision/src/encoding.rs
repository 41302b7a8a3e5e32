//! JPEG encoding of annotated frames.

use bytes::Bytes;
use image::{ImageError, RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("JPEG encode failed: {0}")]
    Jpeg(#[from] ImageError),
    #[error("refusing to encode an empty {width}x{height} frame")]
    Empty { width: u32, height: u32 },
}

/// Encode `image` as a baseline JPEG at `quality` (clamped to `1..=100`).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::Empty { width, height });
    }
    let mut buffer = Vec::with_capacity(width as usize * height as usize / 4);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn encodes_a_decodable_jpeg() {
        let image = RgbImage::from_pixel(64, 48, Rgb([200, 30, 30]));
        let jpeg = encode_jpeg(&image, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn empty_frames_are_rejected() {
        let err = encode_jpeg(&RgbImage::new(0, 10), 80).unwrap_err();
        assert!(matches!(err, EncodeError::Empty { width: 0, height: 10 }));
    }

    #[test]
    fn lower_quality_produces_smaller_output() {
        let mut image = RgbImage::new(64, 64);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 4) as u8, (y * 4) as u8, ((x ^ y) * 8) as u8]);
        }
        let high = encode_jpeg(&image, 95).unwrap();
        let low = encode_jpeg(&image, 10).unwrap();
        assert!(low.len() < high.len());
    }
}
