//! ONNX inference wrapper producing image embeddings.
//!
//! `ClipVision` owns one `ort` session built from the bundled vision
//! encoder. The session is a single mutable compute context: `embed` takes
//! `&mut self`, and callers that want parallel inference need one instance
//! per worker. All backend resources are released when the value drops, on
//! every exit path; there is no manual close.

use std::path::Path;

use image::DynamicImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use crate::index::{preprocess, EMBEDDING_DIM};

/// Error type for embedding operations.
///
/// `ModelLoad` disables the whole subsystem (nothing can be embedded until
/// the artifact is fixed); the other variants are local to one image and
/// never abort a batch.
#[derive(Debug, thiserror::Error)]
pub enum EmbedderError {
    #[error("model initialization failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

/// The seam between the pipeline and the inference backend.
///
/// Implementations produce fixed-length vectors from decoded images and
/// identify the model they embody, so the store can refuse vectors written
/// by a different model.
pub trait EmbeddingProvider {
    /// Output vector length. Uniform for every embedding this provider
    /// produces.
    fn dimensions(&self) -> usize;

    /// SHA256 identity of the model, persisted in the store header.
    fn model_id(&self) -> [u8; 32];

    /// Embed one decoded image. Stateless with respect to prior calls;
    /// `&mut self` only models the non-reentrant compute context.
    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>, EmbedderError>;
}

/// CLIP vision encoder over an ONNX session.
pub struct ClipVision {
    session: Session,
    model_name: String,
}

impl ClipVision {
    /// Load the vision encoder from a bundled ONNX artifact. This is the
    /// one-time initialization of the inference backend; a failure here is
    /// fatal to any embedding operation.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        let model_name = artifact_name(model_path);

        log::info!("loading vision encoder from {}", model_path.display());

        let session = Session::builder()
            .map_err(|e| EmbedderError::ModelLoad(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| EmbedderError::ModelLoad(e.to_string()))?
            .with_intra_threads(4)
            .map_err(|e| EmbedderError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| {
                EmbedderError::ModelLoad(format!("{}: {e}", model_path.display()))
            })?;

        Ok(Self {
            session,
            model_name,
        })
    }

    /// Run one inference over a preprocessed tensor.
    pub fn embed(&mut self, pixels: Array4<f32>) -> Result<Vec<f32>, EmbedderError> {
        // Capture I/O names before the mutable borrow for run()
        let input_name = self
            .session
            .inputs()
            .first()
            .map(|i| i.name().to_string())
            .unwrap_or_else(|| "pixel_values".to_string());
        let output_name = self
            .session
            .outputs()
            .first()
            .map(|o| o.name().to_string())
            .unwrap_or_else(|| "image_embeds".to_string());

        let input = Tensor::from_array(pixels)
            .map_err(|e| EmbedderError::Inference(format!("input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![input_name => input])
            .map_err(|e| EmbedderError::Inference(e.to_string()))?;

        let output = outputs
            .get(&output_name)
            .ok_or_else(|| EmbedderError::Inference(format!("no output '{output_name}'")))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::Inference(e.to_string()))?;

        if data.len() != EMBEDDING_DIM {
            return Err(EmbedderError::Inference(format!(
                "unexpected output shape {shape:?}: expected {EMBEDDING_DIM} values, got {}",
                data.len()
            )));
        }

        if data.iter().any(|v| !v.is_finite()) {
            return Err(EmbedderError::Inference(
                "embedding contains non-finite values".to_string(),
            ));
        }

        Ok(data.to_vec())
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }
}

impl EmbeddingProvider for ClipVision {
    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn model_id(&self) -> [u8; 32] {
        model_id_hash(&self.model_name)
    }

    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>, EmbedderError> {
        self.embed(preprocess(image))
    }
}

/// Model identity for an artifact path, computable without loading the
/// session. Matches what a `ClipVision` loaded from the same path reports.
pub fn model_id_for_path(model_path: &Path) -> [u8; 32] {
    model_id_hash(&artifact_name(model_path))
}

fn artifact_name(model_path: &Path) -> String {
    model_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| model_path.to_string_lossy().to_string())
}

/// SHA256 hash of a model name for store identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_hash_is_deterministic() {
        assert_eq!(
            model_id_hash("clip-vision.onnx"),
            model_id_hash("clip-vision.onnx")
        );
        assert_ne!(
            model_id_hash("clip-vision.onnx"),
            model_id_hash("siglip-vision.onnx")
        );
    }

    #[test]
    fn test_model_id_for_path_uses_file_name() {
        assert_eq!(
            model_id_for_path(Path::new("/data/models/clip-vision.onnx")),
            model_id_hash("clip-vision.onnx")
        );
    }

    #[test]
    fn test_missing_model_is_a_load_error() {
        let result = ClipVision::load(Path::new("/nonexistent/clip-vision.onnx"));
        assert!(matches!(result, Err(EmbedderError::ModelLoad(_))));
    }

    // Inference tests require the model artifact - run with --ignored
    #[test]
    #[ignore = "requires model file"]
    fn test_embed_produces_fixed_length_vector() {
        let model_path = std::env::var("SNAPDEX_TEST_MODEL").expect("SNAPDEX_TEST_MODEL not set");
        let mut model = ClipVision::load(Path::new(&model_path)).unwrap();

        let image = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            64,
            64,
            image::Rgb([200, 40, 90]),
        ));

        assert!(!model.name().is_empty());

        let first = model.embed_image(&image).unwrap();
        assert_eq!(first.len(), EMBEDDING_DIM);

        // Same model + same image -> identical output
        let second = model.embed_image(&image).unwrap();
        assert_eq!(first, second);
    }
}
