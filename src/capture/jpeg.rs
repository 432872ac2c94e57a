//! JPEG encode/decode on the CPU

use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};

use crate::error::CaptureError;

/// Encode an RGB image at the given quality (clamped to 1..=100)
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, CaptureError> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| CaptureError::Codec(e.to_string()))?;
    Ok(buffer)
}

/// Decode a JPEG into an RGB image
pub fn decode_jpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|img| img.into_rgb8())
        .map_err(|e| CaptureError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn test_solid_color_survives_encoding() {
        let image = RgbImage::from_pixel(16, 16, Rgb([200, 40, 90]));
        let jpeg = encode_jpeg(&image, 90).unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (16, 16));
        let px = decoded.get_pixel(8, 8);
        for (got, want) in px.0.iter().zip([200u8, 40, 90]) {
            assert!((*got as i16 - want as i16).abs() <= 4, "{:?}", px);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(
            decode_jpeg(b"definitely not a jpeg"),
            Err(CaptureError::Codec(_))
        ));
    }
}
