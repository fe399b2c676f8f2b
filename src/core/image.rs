use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

use crate::core::error::EngineError;

/// Decode raw bytes into an image, guessing the format from its content.
///
/// `image` names the input in any resulting `DecodeError`.
pub fn decode_image(image: &str, bytes: &[u8]) -> Result<DynamicImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::decode(image, "zero-byte input"));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| EngineError::decode(image, e))?;

    if reader.format().is_none() {
        return Err(EngineError::decode(image, "unrecognised image format"));
    }

    let decoded = reader.decode().map_err(|e| EngineError::decode(image, e))?;

    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        return Err(EngineError::decode(image, "image has no pixels"));
    }

    Ok(decoded)
}

/// Cheap validity check without keeping the decoded pixels around.
pub fn is_valid_image(bytes: &[u8]) -> bool {
    decode_image("<probe>", bytes).is_ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::io::Cursor;

    /// Diagonal gradient, optionally brightened.
    pub fn gradient(width: u32, height: u32, offset: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = (((x + y) * 255 / (width + height)) as u8).saturating_add(offset);
            Rgb([intensity, intensity, intensity])
        }))
    }

    /// Checkerboard with `cell`-pixel squares.
    pub fn checkerboard(width: u32, height: u32, cell: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            if ((x / cell) + (y / cell)) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    pub fn solid(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([value, value, value])))
    }

    pub fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }
}
