//! Image preprocessing for the vision encoder.
//!
//! Produces exactly the tensor the model saw during training:
//! 1. Resize to 224x224 with Lanczos3. Exact dimensions, aspect ratio not
//!    preserved; there is no letterboxing or center-crop.
//! 2. Scale pixels to [0, 1] and standardize per channel with the CLIP
//!    mean/std constants.
//! 3. Lay out as NCHW `[1, 3, 224, 224]`.

use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;

use crate::index::{CHANNEL_MEAN, CHANNEL_STD, IMAGE_SIZE};

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Decode raw image bytes. Kept separate from `preprocess` so the pipeline
/// can distinguish decode failures from inference failures.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Convert a decoded image into the model's input tensor.
pub fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let size = IMAGE_SIZE as usize;
    let resized = image
        .resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Lanczos3)
        .to_rgb8();

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(x as u32, y as u32);
            for c in 0..3 {
                let value = pixel[c] as f32 / 255.0;
                tensor[[0, c, y, x]] = (value - CHANNEL_MEAN[c]) / CHANNEL_STD[c];
            }
        }
    }

    tensor
}
