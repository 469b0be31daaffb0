use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::store::{ClassLabel, ExemplarStore};

/// Portable projection of an [`ExemplarStore`].
///
/// Serialised as JSON:
///
/// ```json
/// { "modelVersion": "mobilenetv2-12", "embeddingDim": 3,
///   "classes": [ { "label": 0, "name": "cat", "embeddings": [[0.1, 0.2, 0.3]] } ] }
/// ```
///
/// Floats are written in shortest round-trip form, so `import(export(store))`
/// reproduces every embedding bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSnapshot {
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(default)]
    pub classes: Vec<SnapshotClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotClass {
    pub label: ClassLabel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub embeddings: Vec<Vec<f32>>,
}

/// Result of a successful import: the new store plus the class names carried
/// by the snapshot, in label order.
#[derive(Debug, Clone)]
pub struct ImportedSnapshot {
    pub store: ExemplarStore,
    pub names: Vec<(ClassLabel, Option<String>)>,
}

impl ModelSnapshot {
    /// Captures every class with at least one exemplar, in ascending label order.
    /// Empty classes are omitted.
    pub fn from_store<F>(store: &ExemplarStore, model_version: impl Into<String>, name_of: F) -> Self
    where
        F: Fn(ClassLabel) -> Option<String>,
    {
        let classes = store
            .iter()
            .filter(|(_, examples)| !examples.is_empty())
            .map(|(label, examples)| SnapshotClass {
                label,
                name: name_of(label),
                embeddings: examples.iter().map(|e| e.to_vec()).collect(),
            })
            .collect();
        Self {
            model_version: model_version.into(),
            embedding_dim: store.dimension(),
            classes,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ClassifierError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses snapshot JSON. Syntax and type errors surface as `Schema`.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ClassifierError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Validates the snapshot and builds a fresh store from it.
    ///
    /// # Errors
    /// - `Schema` if `embeddingDim` is absent or zero, a label repeats, or any
    ///   embedding's length differs from `embeddingDim`
    /// - `VersionMismatch` if `modelVersion` is not exactly `expected_version`
    pub fn into_store(self, expected_version: &str) -> Result<ImportedSnapshot, ClassifierError> {
        let dim = match self.embedding_dim {
            Some(0) => return Err(ClassifierError::Schema("embeddingDim must be positive".into())),
            Some(dim) => dim,
            None => return Err(ClassifierError::Schema("embeddingDim is missing".into())),
        };
        for class in &self.classes {
            if let Some(position) = class.embeddings.iter().position(|e| e.len() != dim) {
                return Err(ClassifierError::Schema(format!(
                    "Class {} embedding {} has length {} (embeddingDim is {})",
                    class.label,
                    position,
                    class.embeddings[position].len(),
                    dim
                )));
            }
        }
        if self.model_version != expected_version {
            return Err(ClassifierError::VersionMismatch {
                expected: expected_version.to_string(),
                found: self.model_version,
            });
        }

        let mut names = Vec::with_capacity(self.classes.len());
        let mut classes = Vec::with_capacity(self.classes.len());
        for class in self.classes {
            names.push((class.label, class.name));
            classes.push((class.label, class.embeddings));
        }
        let store = ExemplarStore::from_classes(classes)?;
        names.sort_by_key(|(label, _)| *label);
        Ok(ImportedSnapshot { store, names })
    }
}
