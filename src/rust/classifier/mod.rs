mod error;
mod utils;
mod preprocess;
mod embedding;
mod model;
pub mod builder;
mod store;
mod knn;
mod snapshot;
mod evaluation;

pub use error::ClassifierError;
pub use embedding::{Embedding, FeatureExtractor};
pub use preprocess::{decode_image, letterbox, to_nchw_tensor, validate_image, ImageLimits, ACCEPTED_FORMATS};
pub use model::{HistogramExtractor, OnnxExtractor};
pub use builder::{ExtractorBuilder, SharedExtractor};
pub use store::{ClassLabel, ExemplarStore};
pub use knn::{ConfidenceDistribution, NearestNeighbor};
pub use snapshot::{ImportedSnapshot, ModelSnapshot, SnapshotClass};
pub use evaluation::{evaluate, DatasetStats, Evaluation};
