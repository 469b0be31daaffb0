use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::models::{BuiltinModel, ModelInfo};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not downloaded: {0}")]
    NotDownloaded(String),
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Model verification failed")]
    VerificationFailed,
    #[error("Hash mismatch: expected {expected}, got {actual} for {file_type} file")]
    HashMismatch {
        file_type: String,
        expected: String,
        actual: String,
    },
}

/// Keeps extractor weights in a local cache directory.
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        if let Ok(path) = env::var("TEACHABLE_CACHE") {
            return PathBuf::from(path).join("models");
        }
        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("teachable").join("models");
        }
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("teachable").join("models");
        }
        env::temp_dir().join("teachable").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get_model_path(&self, model: BuiltinModel) -> PathBuf {
        let info = model.get_model_info();
        self.models_dir.join(info.name).join("model.onnx")
    }

    pub fn is_model_downloaded(&self, model: BuiltinModel) -> bool {
        let model_path = self.get_model_path(model);
        log::debug!("Model path: {:?} (exists: {})", model_path, model_path.exists());
        model_path.exists()
    }

    /// Returns the model path, or `NotDownloaded` if the file is missing.
    pub fn require_model(&self, model: BuiltinModel) -> Result<PathBuf, ModelError> {
        let path = self.get_model_path(model);
        if path.exists() {
            Ok(path)
        } else {
            Err(ModelError::NotDownloaded(format!(
                "{:?} is not downloaded (expected at {:?})",
                model, path
            )))
        }
    }

    pub async fn download_model(&self, model: BuiltinModel) -> Result<(), ModelError> {
        let info = model.get_model_info();
        let _lock = self.download_lock.lock().await;

        let model_path = self.get_model_path(model);
        if model_path.exists() && self.verify_file(&model_path, info.model_hash.as_deref())? {
            log::info!("Existing model file verified at {:?}", model_path);
            return Ok(());
        }

        match self.download_and_verify_file(&info, &model_path).await {
            Ok(()) => {
                log::info!("Model {} ready to use", info.name);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to set up model file: {}", e);
                let _ = self.remove_download(model);
                Err(e)
            }
        }
    }

    /// Returns true when the file matches `expected_hash`, or when no hash is known.
    fn verify_file(&self, path: &Path, expected_hash: Option<&str>) -> Result<bool, ModelError> {
        let Some(expected) = expected_hash else {
            log::warn!("No checksum known for {:?}, skipping verification", path);
            return Ok(true);
        };
        let bytes = fs::read(path)?;
        let hash = sha256_hex(&bytes);
        log::debug!("Calculated hash: {} (expected {})", hash, expected);
        Ok(hash == expected)
    }

    pub fn verify_model(&self, model: BuiltinModel) -> Result<bool, ModelError> {
        let info = model.get_model_info();
        let model_path = self.get_model_path(model);
        if !model_path.exists() {
            return Ok(false);
        }
        self.verify_file(&model_path, info.model_hash.as_deref())
    }

    async fn download_and_verify_file(&self, info: &ModelInfo, path: &Path) -> Result<(), ModelError> {
        log::info!("Downloading model from {} to {:?}", info.model_url, path);
        let response = reqwest::get(&info.model_url).await?.error_for_status()?;
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        if let Some(expected) = info.model_hash.as_deref() {
            let hash = sha256_hex(&bytes);
            if hash != expected {
                log::error!("Model hash mismatch: expected {}, got {}", expected, hash);
                return Err(ModelError::HashMismatch {
                    file_type: "model".to_string(),
                    expected: expected.to_string(),
                    actual: hash,
                });
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        if !self.verify_file(path, info.model_hash.as_deref())? {
            return Err(ModelError::VerificationFailed);
        }
        Ok(())
    }

    pub fn remove_download(&self, model: BuiltinModel) -> Result<(), ModelError> {
        let model_path = self.get_model_path(model);
        if model_path.exists() {
            fs::remove_file(&model_path)?;
        }
        Ok(())
    }

    /// Ensures that a model is downloaded and verified, re-downloading on mismatch.
    pub async fn ensure_model_downloaded(&self, model: BuiltinModel) -> Result<PathBuf, ModelError> {
        if !self.is_model_downloaded(model) {
            log::info!("Model {:?} not found, downloading...", model);
            self.download_model(model).await?;
        } else if !self.verify_model(model)? {
            log::info!("Model verification failed, re-downloading...");
            self.remove_download(model)?;
            self.download_model(model).await?;
        }
        Ok(self.get_model_path(model))
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_models_dir() {
        env::set_var("TEACHABLE_CACHE", "/tmp/teachable-test-cache");
        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("/tmp/teachable-test-cache/models"));
        env::remove_var("TEACHABLE_CACHE");

        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("teachable"));
    }

    #[test]
    fn test_missing_model_reported() {
        let dir = env::temp_dir().join("teachable-manager-missing");
        let manager = ModelManager::new(&dir).unwrap();
        manager.remove_download(BuiltinModel::MobileNetV2).unwrap();
        assert!(!manager.is_model_downloaded(BuiltinModel::MobileNetV2));
        assert!(matches!(
            manager.require_model(BuiltinModel::MobileNetV2),
            Err(ModelError::NotDownloaded(_))
        ));
    }

    #[test]
    fn test_verify_file_hash() {
        let dir = env::temp_dir().join("teachable-manager-verify");
        let manager = ModelManager::new(&dir).unwrap();
        let path = dir.join("blob.bin");
        fs::write(&path, b"abc").unwrap();

        let good = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(manager.verify_file(&path, Some(good)).unwrap());
        assert!(!manager.verify_file(&path, Some("00")).unwrap());
        assert!(manager.verify_file(&path, None).unwrap());
    }
}
