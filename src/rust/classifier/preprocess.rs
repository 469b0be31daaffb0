use std::io::Cursor;

use image::{imageops, DynamicImage, ImageFormat, ImageReader, RgbImage};
use ndarray::Array4;

use super::error::ClassifierError;

/// Bounds applied to uploaded images before they are decoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            min_dimension: 32,
            max_dimension: 4096,
        }
    }
}

/// Upload formats accepted by [`validate_image`].
pub const ACCEPTED_FORMATS: [ImageFormat; 4] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP, ImageFormat::Gif];

/// Decodes image bytes, rejecting empty input and zero-area images.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ClassifierError> {
    if bytes.is_empty() {
        return Err(ClassifierError::InvalidImage("Image data is empty".into()));
    }
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(ClassifierError::InvalidImage("Image has zero area".into()));
    }
    Ok(image)
}

/// Checks size, format and dimensions against `limits`, then decodes.
///
/// Only [`ACCEPTED_FORMATS`] pass, even when the `image` crate could decode
/// others such as BMP or TIFF.
///
/// Dimensions are read from the header first so oversized images are rejected
/// without allocating their pixel buffers.
pub fn validate_image(bytes: &[u8], limits: &ImageLimits) -> Result<DynamicImage, ClassifierError> {
    if bytes.is_empty() {
        return Err(ClassifierError::InvalidImage("Image data is empty".into()));
    }
    if bytes.len() > limits.max_bytes {
        return Err(ClassifierError::InvalidImage(format!(
            "Image too large: {} bytes (max: {})",
            bytes.len(),
            limits.max_bytes
        )));
    }

    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ClassifierError::InvalidImage(e.to_string()))?;
    match reader.format() {
        Some(format) if ACCEPTED_FORMATS.contains(&format) => {}
        Some(format) => {
            return Err(ClassifierError::InvalidImage(format!(
                "Unsupported image format: {:?} (expected JPEG, PNG, WebP or GIF)",
                format
            )))
        }
        None => return Err(ClassifierError::InvalidImage("Unrecognised image format".into())),
    }
    let (width, height) = reader.into_dimensions()?;
    if width == 0 || height == 0 {
        return Err(ClassifierError::InvalidImage("Image has zero area".into()));
    }
    if width < limits.min_dimension || height < limits.min_dimension {
        return Err(ClassifierError::InvalidImage(format!(
            "Image too small: {}x{} (min: {}x{})",
            width, height, limits.min_dimension, limits.min_dimension
        )));
    }
    if width > limits.max_dimension || height > limits.max_dimension {
        return Err(ClassifierError::InvalidImage(format!(
            "Image too large: {}x{} (max: {}x{})",
            width, height, limits.max_dimension, limits.max_dimension
        )));
    }

    decode_image(bytes)
}

/// Scales the image to fit a `size`x`size` square, keeping its aspect ratio,
/// and centres it on a black canvas.
pub fn letterbox(image: &DynamicImage, size: u32) -> RgbImage {
    if image.width() == size && image.height() == size {
        return image.to_rgb8();
    }
    let scaled = image.resize(size, size, imageops::FilterType::Triangle).to_rgb8();
    if scaled.width() == size && scaled.height() == size {
        return scaled;
    }

    let mut canvas = RgbImage::new(size, size);
    let x_offset = (size - scaled.width().min(size)) / 2;
    let y_offset = (size - scaled.height().min(size)) / 2;
    imageops::overlay(&mut canvas, &scaled, i64::from(x_offset), i64::from(y_offset));
    canvas
}

/// Converts an RGB image to a `[1, 3, H, W]` tensor scaled to [0,1] and then
/// normalised per channel with `mean` and `std`.
pub fn to_nchw_tensor(rgb: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
        let pixel = rgb.get_pixel(x as u32, y as u32);
        (f32::from(pixel[c]) / 255.0 - mean[c]) / std[c]
    })
}
