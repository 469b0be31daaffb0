use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classifier::{ClassifierError, ImageLimits};

/// Limits and tuning knobs for a classifier session.
///
/// ```
/// use teachable::ClassifierConfig;
///
/// let config = ClassifierConfig { k: Some(5), ..ClassifierConfig::default() };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Fewest examples a class needs before training may start
    pub min_examples_per_class: usize,
    /// Most examples a class may hold when training starts
    pub max_examples_per_class: usize,
    /// Fewest classes needed before training may start
    pub min_classes: usize,
    /// Neighbours that vote in a prediction; `None` lets every exemplar vote
    pub k: Option<usize>,
    /// Progress fraction reported once the extractor has loaded
    pub warmup_fraction: f64,
    pub load_timeout_secs: u64,
    pub max_image_bytes: usize,
    pub min_image_dimension: u32,
    pub max_image_dimension: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        let limits = ImageLimits::default();
        Self {
            min_examples_per_class: 3,
            max_examples_per_class: 1000,
            min_classes: 2,
            k: None,
            warmup_fraction: 0.15,
            load_timeout_secs: 60,
            max_image_bytes: limits.max_bytes,
            min_image_dimension: limits.min_dimension,
            max_image_dimension: limits.max_dimension,
        }
    }
}

impl ClassifierConfig {
    /// Defaults overlaid with any `TEACHABLE_*` environment variables, e.g.
    /// `TEACHABLE_K=5` or `TEACHABLE_LOAD_TIMEOUT_SECS=120`.
    pub fn from_env() -> Result<Self, ClassifierError> {
        let mut config = Self::default();
        if let Some(v) = read_env("TEACHABLE_MIN_EXAMPLES_PER_CLASS")? {
            config.min_examples_per_class = v;
        }
        if let Some(v) = read_env("TEACHABLE_MAX_EXAMPLES_PER_CLASS")? {
            config.max_examples_per_class = v;
        }
        if let Some(v) = read_env("TEACHABLE_MIN_CLASSES")? {
            config.min_classes = v;
        }
        if let Some(v) = read_env("TEACHABLE_K")? {
            config.k = Some(v);
        }
        if let Some(v) = read_env("TEACHABLE_WARMUP_FRACTION")? {
            config.warmup_fraction = v;
        }
        if let Some(v) = read_env("TEACHABLE_LOAD_TIMEOUT_SECS")? {
            config.load_timeout_secs = v;
        }
        if let Some(v) = read_env("TEACHABLE_MAX_IMAGE_BYTES")? {
            config.max_image_bytes = v;
        }
        if let Some(v) = read_env("TEACHABLE_MIN_IMAGE_DIMENSION")? {
            config.min_image_dimension = v;
        }
        if let Some(v) = read_env("TEACHABLE_MAX_IMAGE_DIMENSION")? {
            config.max_image_dimension = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ClassifierError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ClassifierError::InvalidConfig(format!("Failed to read {:?}: {}", path, e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::InvalidConfig(format!("Failed to parse {:?}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.min_examples_per_class > self.max_examples_per_class {
            return Err(ClassifierError::InvalidConfig(format!(
                "min_examples_per_class ({}) exceeds max_examples_per_class ({})",
                self.min_examples_per_class, self.max_examples_per_class
            )));
        }
        if self.k == Some(0) {
            return Err(ClassifierError::InvalidConfig("k must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.warmup_fraction) {
            return Err(ClassifierError::InvalidConfig(format!(
                "warmup_fraction must be in [0, 1), got {}",
                self.warmup_fraction
            )));
        }
        if self.load_timeout_secs == 0 {
            return Err(ClassifierError::InvalidConfig("load_timeout_secs must be positive".into()));
        }
        if self.min_image_dimension > self.max_image_dimension {
            return Err(ClassifierError::InvalidConfig(
                "min_image_dimension exceeds max_image_dimension".into(),
            ));
        }
        Ok(())
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits {
            max_bytes: self.max_image_bytes,
            min_dimension: self.min_image_dimension,
            max_dimension: self.max_image_dimension,
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs)
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>, ClassifierError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ClassifierError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
