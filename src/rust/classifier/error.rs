use ort::Error as OrtError;

use super::store::ClassLabel;
use crate::model_manager::ModelError;

/// Represents the different types of errors that can occur in the classifier engine.
///
/// Every rejected operation leaves the exemplar store and any previously trained
/// state untouched. The one exception is a training run aborted mid-loop, which
/// keeps the exemplars it already added.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    /// The feature extractor weights could not be fetched or initialized
    #[error("Model load error: {0}")]
    ModelLoad(String),
    /// The extractor was loaded but failed while running on an input
    #[error("Inference error: {0}")]
    Inference(String),
    /// Bad, corrupt or out-of-bounds image input
    #[error("Invalid image: {0}")]
    InvalidImage(String),
    /// An embedding does not match the store's established dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// A snapshot is structurally invalid
    #[error("Schema error: {0}")]
    Schema(String),
    /// A snapshot was produced by an incompatible extractor
    #[error("Version mismatch: expected model version '{expected}', found '{found}'")]
    VersionMismatch { expected: String, found: String },
    /// A positional index does not exist for the given class
    #[error("Index {index} out of range for class {label} ({len} examples)")]
    IndexOutOfRange {
        label: ClassLabel,
        index: usize,
        len: usize,
    },
    /// Not enough classes or examples to start training
    #[error("Insufficient data: {0}")]
    InsufficientData(String),
    /// The label was never created or has been deleted
    #[error("Unknown class {0}")]
    UnknownClass(ClassLabel),
    /// A training run currently owns the store
    #[error("Session busy: {0}")]
    Busy(String),
    /// A training run was cancelled between steps
    #[error("Training cancelled")]
    Cancelled,
    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClassifierError {
    /// Stable name of the error kind, reported in terminal `Failed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ModelLoad(_) => "ModelLoadError",
            Self::Inference(_) => "InferenceError",
            Self::InvalidImage(_) => "InvalidImageError",
            Self::DimensionMismatch { .. } => "DimensionMismatchError",
            Self::Schema(_) => "SchemaError",
            Self::VersionMismatch { .. } => "VersionMismatchError",
            Self::IndexOutOfRange { .. } => "IndexOutOfRangeError",
            Self::InsufficientData(_) => "InsufficientDataError",
            Self::UnknownClass(_) => "UnknownClassError",
            Self::Busy(_) => "BusyError",
            Self::Cancelled => "Cancelled",
            Self::InvalidConfig(_) => "InvalidConfigError",
        }
    }
}

impl From<OrtError> for ClassifierError {
    fn from(err: OrtError) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

impl From<ModelError> for ClassifierError {
    fn from(err: ModelError) -> Self {
        ClassifierError::ModelLoad(err.to_string())
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::InvalidImage(err.to_string())
    }
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        ClassifierError::Schema(err.to_string())
    }
}
