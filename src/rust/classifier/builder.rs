use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::sync::OnceCell;

use super::embedding::FeatureExtractor;
use super::error::ClassifierError;
use super::model::{HistogramExtractor, OnnxExtractor};
use crate::models::{BuiltinModel, ModelCharacteristics, IMAGENET_MEAN, IMAGENET_STD};
use crate::runtime::RuntimeConfig;
use crate::ModelManager;

type LoadFn = dyn Fn() -> Result<Arc<dyn FeatureExtractor>, ClassifierError> + Send + Sync;

#[derive(Clone)]
struct Loader(Arc<LoadFn>);

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Loader(..)")
    }
}

#[derive(Debug, Clone)]
enum ExtractorSource {
    Builtin(BuiltinModel),
    Custom {
        model_path: PathBuf,
        version: String,
        characteristics: ModelCharacteristics,
    },
    Histogram { bins: u32 },
    External { version: String, loader: Loader },
}

/// Describes which feature extractor to load and how.
///
/// Building is the expensive step (reading tens of MB of weights and creating
/// an inference session), so the builder only records configuration until
/// [`ExtractorBuilder::build`] is called.
///
/// # Example
/// ```
/// use teachable::ExtractorBuilder;
///
/// let builder = ExtractorBuilder::new().with_histogram(4)?;
/// assert_eq!(builder.model_version(), "rgb-histogram-4");
/// # Ok::<(), teachable::ClassifierError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ExtractorBuilder {
    source: ExtractorSource,
    runtime_config: RuntimeConfig,
    models_dir: Option<PathBuf>,
}

impl Default for ExtractorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorBuilder {
    /// Starts from the builtin MobileNetV2 model
    pub fn new() -> Self {
        Self {
            source: ExtractorSource::Builtin(BuiltinModel::MobileNetV2),
            runtime_config: RuntimeConfig::default(),
            models_dir: None,
        }
    }

    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.runtime_config = config;
        self
    }

    /// Uses a builtin model, read from the model manager's cache directory.
    pub fn with_model(mut self, model: BuiltinModel) -> Self {
        self.source = ExtractorSource::Builtin(model);
        self
    }

    /// Overrides the cache directory builtin models are read from.
    pub fn with_models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = Some(dir.into());
        self
    }

    /// Uses a custom ONNX model with ImageNet normalisation.
    ///
    /// `version` is written into exported snapshots and compared on import, so it
    /// must change whenever the weights change.
    pub fn with_custom_model(
        mut self,
        model_path: impl Into<PathBuf>,
        version: impl Into<String>,
        input_size: u32,
    ) -> Result<Self, ClassifierError> {
        let model_path = model_path.into();
        let version = version.into();
        if model_path.as_os_str().is_empty() {
            return Err(ClassifierError::InvalidConfig("Model path cannot be empty".into()));
        }
        if version.is_empty() {
            return Err(ClassifierError::InvalidConfig("Model version cannot be empty".into()));
        }
        if input_size == 0 {
            return Err(ClassifierError::InvalidConfig("Input size must be positive".into()));
        }
        self.source = ExtractorSource::Custom {
            model_path,
            version,
            characteristics: ModelCharacteristics {
                input_size,
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
                embedding_size: None,
                model_size_mb: 0,
            },
        };
        Ok(self)
    }

    /// Uses the weight-free colour histogram extractor.
    pub fn with_histogram(mut self, bins: u32) -> Result<Self, ClassifierError> {
        HistogramExtractor::new(bins)?;
        self.source = ExtractorSource::Histogram { bins };
        Ok(self)
    }

    /// Uses a caller-supplied [`FeatureExtractor`], created by `load` the first
    /// time it is needed. `load` runs on a blocking thread; `version` must match
    /// what the created extractor reports.
    pub fn with_loader<F>(mut self, version: impl Into<String>, load: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn FeatureExtractor>, ClassifierError> + Send + Sync + 'static,
    {
        self.source = ExtractorSource::External {
            version: version.into(),
            loader: Loader(Arc::new(load)),
        };
        self
    }

    /// The version string the built extractor will report, known before loading.
    pub fn model_version(&self) -> String {
        match &self.source {
            ExtractorSource::Builtin(model) => model.get_model_info().version,
            ExtractorSource::Custom { version, .. } => version.clone(),
            ExtractorSource::Histogram { bins } => HistogramExtractor::version_for(*bins),
            ExtractorSource::External { version, .. } => version.clone(),
        }
    }

    /// Loads the extractor. Blocking; may take seconds for large models.
    pub fn build(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        match &self.source {
            ExtractorSource::Builtin(model) => {
                let manager = match &self.models_dir {
                    Some(dir) => ModelManager::new(dir),
                    None => ModelManager::new_default(),
                }
                .map_err(|e| ClassifierError::ModelLoad(format!("Failed to create model manager: {}", e)))?;
                let path = manager.require_model(*model)?;
                let extractor = OnnxExtractor::load(
                    &path,
                    model.get_model_info().version,
                    &model.characteristics(),
                    &self.runtime_config,
                )?;
                Ok(Arc::new(extractor))
            }
            ExtractorSource::Custom {
                model_path,
                version,
                characteristics,
            } => {
                let extractor =
                    OnnxExtractor::load(model_path, version.clone(), characteristics, &self.runtime_config)?;
                Ok(Arc::new(extractor))
            }
            ExtractorSource::Histogram { bins } => Ok(Arc::new(HistogramExtractor::new(*bins)?)),
            ExtractorSource::External { version, loader } => {
                let extractor = (loader.0)()?;
                if extractor.model_version() != version.as_str() {
                    return Err(ClassifierError::ModelLoad(format!(
                        "Loader for '{}' produced an extractor reporting '{}'",
                        version,
                        extractor.model_version()
                    )));
                }
                Ok(extractor)
            }
        }
    }
}

/// Loads a feature extractor at most once and hands out shared references.
///
/// Meant to be created once per process and passed to every session. A failed or
/// timed-out load is not cached, so a later call retries.
#[derive(Debug)]
pub struct SharedExtractor {
    builder: ExtractorBuilder,
    timeout: Duration,
    cell: OnceCell<Arc<dyn FeatureExtractor>>,
}

impl SharedExtractor {
    pub fn new(builder: ExtractorBuilder, timeout: Duration) -> Self {
        Self {
            builder,
            timeout,
            cell: OnceCell::new(),
        }
    }

    /// Wraps an extractor that is already loaded.
    pub fn preloaded(extractor: Arc<dyn FeatureExtractor>) -> Self {
        let builder = ExtractorBuilder::new();
        Self {
            builder,
            timeout: Duration::ZERO,
            cell: OnceCell::new_with(Some(extractor)),
        }
    }

    pub fn model_version(&self) -> String {
        match self.cell.get() {
            Some(extractor) => extractor.model_version().to_string(),
            None => self.builder.model_version(),
        }
    }

    /// The extractor, if a previous load succeeded.
    pub fn get(&self) -> Option<Arc<dyn FeatureExtractor>> {
        self.cell.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Returns the cached extractor, loading it on first use.
    ///
    /// # Errors
    /// - `ModelLoad` if the weights cannot be initialised or loading exceeds the timeout
    pub async fn load(&self) -> Result<Arc<dyn FeatureExtractor>, ClassifierError> {
        let extractor = self
            .cell
            .get_or_try_init(|| async {
                info!("Loading feature extractor '{}'", self.builder.model_version());
                let builder = self.builder.clone();
                let task = tokio::task::spawn_blocking(move || builder.build());
                match tokio::time::timeout(self.timeout, task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(ClassifierError::ModelLoad(format!(
                        "Extractor load task failed: {}",
                        join_error
                    ))),
                    Err(_) => {
                        error!("Feature extractor load timed out after {:?}", self.timeout);
                        Err(ClassifierError::ModelLoad(format!(
                            "Extractor load timed out after {:?}",
                            self.timeout
                        )))
                    }
                }
            })
            .await?;
        Ok(Arc::clone(extractor))
    }
}
