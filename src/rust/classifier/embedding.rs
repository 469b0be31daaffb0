use std::fmt;

use image::DynamicImage;
use ndarray::Array1;

use super::error::ClassifierError;
use super::preprocess::decode_image;

/// A fixed-length feature vector produced by a [`FeatureExtractor`].
pub type Embedding = Array1<f32>;

/// Maps images to fixed-length embeddings.
///
/// Implementations are stateless once constructed: the heavy model state is
/// allocated when the extractor is built and then only read, so a single
/// instance can be shared across sessions and threads.
///
/// For a fixed model version the output must be deterministic: embedding the
/// same image twice yields the same vector.
pub trait FeatureExtractor: Send + Sync + fmt::Debug {
    /// Identifies the weights that produced an embedding. Snapshots created with
    /// one version are rejected by extractors reporting another.
    fn model_version(&self) -> &str;

    /// Length of every embedding this extractor returns.
    fn embedding_dim(&self) -> usize;

    /// Embeds an already decoded image.
    ///
    /// # Errors
    /// - `InvalidImage` if the image has zero area
    /// - `Inference` if the backing model fails to run
    fn embed(&self, image: &DynamicImage) -> Result<Embedding, ClassifierError>;

    /// Decodes raw image bytes (PNG, JPEG, WebP, GIF, ...) and embeds the result.
    fn embed_bytes(&self, bytes: &[u8]) -> Result<Embedding, ClassifierError> {
        let image = decode_image(bytes)?;
        self.embed(&image)
    }
}
