use std::collections::HashMap;
use std::path::Path;

use image::DynamicImage;
use log::{info, warn};
use ndarray::Array1;
use ort::session::Session;
use ort::value::Tensor;

use super::embedding::{Embedding, FeatureExtractor};
use super::error::ClassifierError;
use super::preprocess::{letterbox, to_nchw_tensor};
use crate::models::ModelCharacteristics;
use crate::runtime::{create_session_builder, RuntimeConfig};

/// Feature extractor backed by an ONNX image model.
///
/// The model is expected to:
/// - Accept one float input of shape `[1, 3, input_size, input_size]` (NCHW)
/// - Produce a first output whose elements, flattened, form the embedding
///
/// Images are letterboxed to the square input size on a black background,
/// scaled to [0,1] and normalised with the model's per-channel mean and std.
#[derive(Debug)]
pub struct OnnxExtractor {
    session: Session,
    input_name: String,
    version: String,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    embedding_dim: usize,
}

impl OnnxExtractor {
    /// Loads the model and infers the embedding size by embedding a blank image.
    ///
    /// # Errors
    /// - `ModelLoad` if the file is missing, cannot be parsed, or has no inputs/outputs
    /// - `ModelLoad` if the blank image run fails or yields an empty output
    pub fn load(
        model_path: &Path,
        version: impl Into<String>,
        characteristics: &ModelCharacteristics,
        runtime_config: &RuntimeConfig,
    ) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelLoad(format!("Model file not found: {:?}", model_path)));
        }
        let session = create_session_builder(runtime_config)?
            .commit_from_file(model_path)
            .map_err(|e| ClassifierError::ModelLoad(format!("Failed to load {:?}: {}", model_path, e)))?;
        Self::validate_model(&session)?;
        let input_name = session.inputs[0].name.clone();

        let mut extractor = Self {
            session,
            input_name,
            version: version.into(),
            input_size: characteristics.input_size,
            mean: characteristics.mean,
            std: characteristics.std,
            embedding_dim: 0,
        };

        let blank = DynamicImage::new_rgb8(characteristics.input_size, characteristics.input_size);
        let embedding = extractor
            .embed(&blank)
            .map_err(|e| ClassifierError::ModelLoad(format!("Warm-up inference failed: {}", e)))?;
        extractor.embedding_dim = embedding.len();
        info!("Inferred embedding size from model: {}", extractor.embedding_dim);

        if let Some(expected) = characteristics.embedding_size {
            if expected != extractor.embedding_dim {
                warn!(
                    "Model produced {} dimensions, {} were expected",
                    extractor.embedding_dim, expected
                );
            }
        }
        Ok(extractor)
    }

    fn validate_model(session: &Session) -> Result<(), ClassifierError> {
        if session.inputs.is_empty() {
            return Err(ClassifierError::ModelLoad("Model must have an image input".to_string()));
        }
        if session.outputs.is_empty() {
            return Err(ClassifierError::ModelLoad(
                "Model must have at least 1 output for embeddings".to_string(),
            ));
        }
        Ok(())
    }
}

impl FeatureExtractor for OnnxExtractor {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn embed(&self, image: &DynamicImage) -> Result<Embedding, ClassifierError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassifierError::InvalidImage("Image has zero area".into()));
        }
        let rgb = letterbox(image, self.input_size);
        let input = to_nchw_tensor(&rgb, self.mean, self.std);

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(input)
                .map_err(|e| ClassifierError::Inference(format!("Failed to create input tensor: {}", e)))?,
        );

        let outputs = self
            .session
            .run(input_tensors)
            .map_err(|e| ClassifierError::Inference(format!("Failed to run model: {}", e)))?;
        let output_tensor = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::Inference(format!("Failed to extract output tensor: {}", e)))?;

        let embedding = Array1::from_iter(output_tensor.iter().copied());
        if embedding.is_empty() {
            return Err(ClassifierError::Inference("Model produced an empty output".into()));
        }
        Ok(embedding)
    }
}

/// Colour-histogram extractor: `bins³` buckets over the RGB cube, each holding
/// the fraction of pixels that fall into it.
///
/// Needs no model weights, which makes it useful offline and in tests. Images are
/// first thumbnailed so cost does not grow with resolution.
#[derive(Debug, Clone)]
pub struct HistogramExtractor {
    bins: u32,
    version: String,
}

impl HistogramExtractor {
    const THUMBNAIL_SIZE: u32 = 64;

    pub fn new(bins: u32) -> Result<Self, ClassifierError> {
        if !(2..=16).contains(&bins) {
            return Err(ClassifierError::InvalidConfig(format!(
                "Histogram bins must be between 2 and 16, got {}",
                bins
            )));
        }
        Ok(Self {
            bins,
            version: Self::version_for(bins),
        })
    }

    pub fn version_for(bins: u32) -> String {
        format!("rgb-histogram-{}", bins)
    }
}

impl FeatureExtractor for HistogramExtractor {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn embedding_dim(&self) -> usize {
        (self.bins * self.bins * self.bins) as usize
    }

    fn embed(&self, image: &DynamicImage) -> Result<Embedding, ClassifierError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassifierError::InvalidImage("Image has zero area".into()));
        }
        let rgb = image
            .thumbnail(Self::THUMBNAIL_SIZE, Self::THUMBNAIL_SIZE)
            .to_rgb8();

        let bucket = |v: u8| u32::from(v) * self.bins / 256;
        let mut histogram = Array1::<f32>::zeros(self.embedding_dim());
        for pixel in rgb.pixels() {
            let [r, g, b] = pixel.0;
            let index = (bucket(r) * self.bins + bucket(g)) * self.bins + bucket(b);
            histogram[index as usize] += 1.0;
        }
        let total = (rgb.width() * rgb.height()) as f32;
        Ok(histogram / total)
    }
}
