//! An incremental image classifier built on pretrained embeddings.
//!
//! Images are mapped to fixed-length feature vectors by a [`FeatureExtractor`],
//! collected per class in an [`ExemplarStore`], and classified by a
//! similarity-weighted nearest-neighbour vote. The store can be exported to and
//! imported from a JSON snapshot.
//!
//! # Basic Usage
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use ndarray::array;
//! use teachable::{ClassLabel, ExemplarStore, NearestNeighbor};
//!
//! let mut store = ExemplarStore::new();
//! store.add_example(ClassLabel(0), array![1.0, 0.0, 0.0])?;
//! store.add_example(ClassLabel(1), array![0.0, 1.0, 0.0])?;
//!
//! let distribution = NearestNeighbor::default()
//!     .predict(&store, &array![0.9, 0.1, 0.0])?
//!     .expect("store is not empty");
//! assert_eq!(distribution.top().map(|(label, _)| label), Some(ClassLabel(0)));
//! # Ok(())
//! # }
//! ```
//!
//! # Sessions
//!
//! [`ClassifierSession`] wraps the engine behind the operations a UI needs:
//! named classes, image upload, a training run that reports progress, live
//! prediction and snapshot import/export. The extractor is loaded once per
//! process through a [`SharedExtractor`] and shared by every session.
//!
//! ```rust
//! # async fn demo() -> Result<(), teachable::ClassifierError> {
//! use std::sync::Arc;
//! use teachable::{ClassifierConfig, ClassifierSession, ExtractorBuilder, SharedExtractor};
//!
//! let config = ClassifierConfig::default();
//! let builder = ExtractorBuilder::new().with_histogram(4)?;
//! let extractor = Arc::new(SharedExtractor::new(builder, config.load_timeout()));
//! let session = ClassifierSession::new(extractor, config)?;
//! assert!(session.predict_live(&[]).await?.is_none());
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod model_manager;
pub mod models;
mod runtime;
pub mod session;
pub mod training;

pub use classifier::{
    ClassLabel, ClassifierError, ConfidenceDistribution, DatasetStats, Embedding, Evaluation, ExemplarStore,
    ExtractorBuilder, FeatureExtractor, HistogramExtractor, ImageLimits, ModelSnapshot, NearestNeighbor,
    OnnxExtractor, SharedExtractor,
};
pub use config::ClassifierConfig;
pub use model_manager::{ModelError, ModelManager};
pub use models::{BuiltinModel, ModelCharacteristics, ModelInfo};
pub use runtime::{create_session_builder, RuntimeConfig};
pub use session::{ClassInfo, ClassifierSession, Prediction};
pub use training::{CancellationFlag, Phase, ProgressEvent, SessionState, TrainingFailure, TrainingHandle, TrainingSummary};

pub fn init_logger() {
    env_logger::init();
}
