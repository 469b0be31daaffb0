/// Represents the available built-in feature extractors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinModel {
    /// MobileNetV2 (ONNX opset 12) trained on ImageNet.
    ///
    /// Characteristics:
    /// - Input: 224x224 RGB, ImageNet mean/std normalisation
    /// - Embedding size: 1000
    /// - Size: ~14MB
    MobileNetV2,
}

/// Characteristics of a model including its input contract
#[derive(Debug, Clone, PartialEq)]
pub struct ModelCharacteristics {
    /// Side length of the square input image
    pub input_size: u32,
    /// Per-channel mean subtracted after scaling pixels to [0,1]
    pub mean: [f32; 3],
    /// Per-channel standard deviation divided out after mean subtraction
    pub std: [f32; 3],
    /// Expected length of the produced embedding, if known ahead of load
    pub embedding_size: Option<usize>,
    /// Approximate size of the model in memory
    pub model_size_mb: usize,
}

/// Download and identity information for a model
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    /// Compared verbatim against snapshot `modelVersion` fields
    pub version: String,
    pub model_url: String,
    /// SHA-256 of the model file; when absent the download is not verified
    pub model_hash: Option<String>,
}

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl BuiltinModel {
    /// Get the characteristics of the model
    pub fn characteristics(&self) -> ModelCharacteristics {
        match self {
            Self::MobileNetV2 => ModelCharacteristics {
                input_size: 224,
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
                embedding_size: Some(1000),
                model_size_mb: 14,
            },
        }
    }

    pub fn get_model_info(&self) -> ModelInfo {
        match self {
            Self::MobileNetV2 => ModelInfo {
                name: "mobilenetv2-12".to_string(),
                version: "mobilenetv2-12".to_string(),
                model_url: "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-12.onnx".to_string(),
                model_hash: None,
            },
        }
    }
}
