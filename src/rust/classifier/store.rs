use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use ndarray::Array1;
use serde::{Deserialize, Serialize};

use super::embedding::Embedding;
use super::error::ClassifierError;

/// Opaque class identifier. Ordered by its ordinal, which is also the tie-break
/// order used by the nearest-neighbour vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassLabel(pub u32);

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-class, insertion-ordered embedding sequences.
///
/// Every stored embedding has the same length and holds only finite values, so
/// any store can be written to snapshot JSON and read back. The length is fixed
/// by the first example added to an empty store and only reset by
/// [`ExemplarStore::clear_all`].
/// Failed operations leave the store untouched.
///
/// Indices are positional: removing index `i` shifts every later exemplar of that
/// class down by one, so callers must not cache indices across a removal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExemplarStore {
    classes: BTreeMap<ClassLabel, Vec<Embedding>>,
    dimension: Option<usize>,
}

impl ExemplarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an embedding to the class, creating the class on first use.
    pub fn add_example(&mut self, label: ClassLabel, embedding: Embedding) -> Result<(), ClassifierError> {
        if embedding.is_empty() {
            return Err(ClassifierError::Schema("Embedding cannot be empty".into()));
        }
        if let Some(position) = embedding.iter().position(|v| !v.is_finite()) {
            return Err(ClassifierError::Schema(format!(
                "Embedding value {} is not a finite number",
                position
            )));
        }
        if let Some(expected) = self.dimension {
            if embedding.len() != expected {
                return Err(ClassifierError::DimensionMismatch {
                    expected,
                    actual: embedding.len(),
                });
            }
        }
        if self.dimension.is_none() {
            self.dimension = Some(embedding.len());
        }
        let examples = self.classes.entry(label).or_default();
        examples.push(embedding);
        debug!("Added example {} to class {}", examples.len() - 1, label);
        Ok(())
    }

    /// Removes and returns the embedding at `index` for the class.
    pub fn remove_example(&mut self, label: ClassLabel, index: usize) -> Result<Embedding, ClassifierError> {
        let len = self.example_count(label);
        match self.classes.get_mut(&label) {
            Some(examples) if index < examples.len() => Ok(examples.remove(index)),
            _ => Err(ClassifierError::IndexOutOfRange { label, index, len }),
        }
    }

    /// Empties one class. The class keeps its slot and the established dimension stays.
    pub fn clear_class(&mut self, label: ClassLabel) {
        if let Some(examples) = self.classes.get_mut(&label) {
            examples.clear();
        }
    }

    /// Drops a class entirely so it no longer appears in predictions.
    pub fn remove_class(&mut self, label: ClassLabel) -> Option<Vec<Embedding>> {
        self.classes.remove(&label)
    }

    /// Empties every class and forgets the established dimension.
    pub fn clear_all(&mut self) {
        self.classes.clear();
        self.dimension = None;
    }

    /// Number of classes with at least one exemplar.
    pub fn class_count(&self) -> usize {
        self.classes.values().filter(|v| !v.is_empty()).count()
    }

    pub fn example_count(&self, label: ClassLabel) -> usize {
        self.classes.get(&label).map_or(0, Vec::len)
    }

    pub fn total_examples(&self) -> usize {
        self.classes.values().map(Vec::len).sum()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.total_examples() == 0
    }

    /// All labels known to the store in ascending order, including emptied classes.
    pub fn labels(&self) -> impl Iterator<Item = ClassLabel> + '_ {
        self.classes.keys().copied()
    }

    pub fn examples(&self, label: ClassLabel) -> Option<&[Embedding]> {
        self.classes.get(&label).map(Vec::as_slice)
    }

    pub fn get(&self, label: ClassLabel, index: usize) -> Option<&Embedding> {
        self.classes.get(&label).and_then(|v| v.get(index))
    }

    /// Iterates classes in ascending label order.
    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, &[Embedding])> + '_ {
        self.classes.iter().map(|(label, v)| (*label, v.as_slice()))
    }

    /// Builds a store from whole classes at once, validating that all
    /// embeddings share one non-zero length. Used by snapshot import.
    pub(crate) fn from_classes(
        classes: impl IntoIterator<Item = (ClassLabel, Vec<Vec<f32>>)>,
    ) -> Result<Self, ClassifierError> {
        let mut store = Self::new();
        for (label, embeddings) in classes {
            if store.classes.contains_key(&label) {
                return Err(ClassifierError::Schema(format!("Duplicate class label {}", label)));
            }
            let mut examples = Vec::with_capacity(embeddings.len());
            for values in embeddings {
                let expected = *store.dimension.get_or_insert(values.len());
                if values.is_empty() || values.len() != expected {
                    return Err(ClassifierError::Schema(format!(
                        "Class {} has an embedding of length {} (expected {})",
                        label,
                        values.len(),
                        expected
                    )));
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(ClassifierError::Schema(format!(
                        "Class {} has an embedding with non-finite values",
                        label
                    )));
                }
                examples.push(Array1::from(values));
            }
            store.classes.insert(label, examples);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_dimension_fixed_by_first_example() {
        let mut store = ExemplarStore::new();
        assert_eq!(store.dimension(), None);
        store.add_example(ClassLabel(0), array![1.0, 0.0, 0.0]).unwrap();
        assert_eq!(store.dimension(), Some(3));

        store.clear_class(ClassLabel(0));
        assert_eq!(store.dimension(), Some(3));
        assert_eq!(store.class_count(), 0);

        store.clear_all();
        assert_eq!(store.dimension(), None);
        store.add_example(ClassLabel(0), array![1.0, 2.0]).unwrap();
        assert_eq!(store.dimension(), Some(2));
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let mut store = ExemplarStore::new();
        let result = store.add_example(ClassLabel(0), Array1::zeros(0));
        assert!(matches!(result, Err(ClassifierError::Schema(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_non_finite_embedding_rejected() {
        let mut store = ExemplarStore::new();
        store.add_example(ClassLabel(0), array![1.0, 2.0]).unwrap();
        let before = store.clone();

        for bad in [array![f32::NAN, 1.0], array![1.0, f32::INFINITY], array![f32::NEG_INFINITY, 0.0]] {
            assert!(matches!(
                store.add_example(ClassLabel(1), bad),
                Err(ClassifierError::Schema(_))
            ));
        }
        assert_eq!(store, before);

        let result = ExemplarStore::from_classes(vec![(ClassLabel(0), vec![vec![f32::NAN, 1.0]])]);
        assert!(matches!(result, Err(ClassifierError::Schema(_))));
    }

    #[test]
    fn test_remove_from_unknown_class() {
        let mut store = ExemplarStore::new();
        let err = store.remove_example(ClassLabel(7), 0).unwrap_err();
        assert!(matches!(err, ClassifierError::IndexOutOfRange { index: 0, len: 0, .. }));
    }

    #[test]
    fn test_from_classes_rejects_ragged_input() {
        let result = ExemplarStore::from_classes(vec![
            (ClassLabel(0), vec![vec![1.0, 2.0]]),
            (ClassLabel(1), vec![vec![1.0, 2.0, 3.0]]),
        ]);
        assert!(matches!(result, Err(ClassifierError::Schema(_))));
    }
}
