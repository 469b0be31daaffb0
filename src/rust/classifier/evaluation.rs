use std::collections::BTreeMap;

use serde::Serialize;

use super::error::ClassifierError;
use super::knn::NearestNeighbor;
use super::store::{ClassLabel, ExemplarStore};

/// Leave-one-out performance of the nearest-neighbour classifier on its own store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// Fraction of exemplars whose top prediction, with the exemplar itself
    /// removed, is their own class
    pub accuracy: f64,
    /// Row and column order of the confusion matrix
    pub labels: Vec<ClassLabel>,
    /// `confusion_matrix[true][predicted]` counts
    pub confusion_matrix: Vec<Vec<usize>>,
    pub evaluated: usize,
}

/// Runs leave-one-out evaluation. `None` when fewer than two exemplars exist.
pub fn evaluate(store: &ExemplarStore, classifier: &NearestNeighbor) -> Result<Option<Evaluation>, ClassifierError> {
    if store.total_examples() < 2 {
        return Ok(None);
    }
    let labels: Vec<ClassLabel> = store
        .iter()
        .filter(|(_, examples)| !examples.is_empty())
        .map(|(label, _)| label)
        .collect();
    let position: BTreeMap<ClassLabel, usize> = labels.iter().enumerate().map(|(i, l)| (*l, i)).collect();
    let mut confusion_matrix = vec![vec![0usize; labels.len()]; labels.len()];
    let mut correct = 0usize;
    let mut evaluated = 0usize;

    for (label, examples) in store.iter() {
        for (index, exemplar) in examples.iter().enumerate() {
            let Some(distribution) = classifier.predict_excluding(store, exemplar, Some((label, index)))? else {
                continue;
            };
            let Some((predicted, _)) = distribution.top() else {
                continue;
            };
            if let (Some(&row), Some(&col)) = (position.get(&label), position.get(&predicted)) {
                confusion_matrix[row][col] += 1;
            }
            evaluated += 1;
            if predicted == label {
                correct += 1;
            }
        }
    }

    let accuracy = if evaluated == 0 {
        0.0
    } else {
        correct as f64 / evaluated as f64
    };
    Ok(Some(Evaluation {
        accuracy,
        labels,
        confusion_matrix,
        evaluated,
    }))
}

/// Summary of how many examples each class holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub total_classes: usize,
    pub total_images: usize,
    pub images_per_class: BTreeMap<ClassLabel, usize>,
    pub min_images_per_class: usize,
    pub max_images_per_class: usize,
}

impl DatasetStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (ClassLabel, usize)>) -> Self {
        let images_per_class: BTreeMap<ClassLabel, usize> = counts.into_iter().collect();
        Self {
            total_classes: images_per_class.len(),
            total_images: images_per_class.values().sum(),
            min_images_per_class: images_per_class.values().copied().min().unwrap_or(0),
            max_images_per_class: images_per_class.values().copied().max().unwrap_or(0),
            images_per_class,
        }
    }

    pub fn from_store(store: &ExemplarStore) -> Self {
        Self::from_counts(store.iter().map(|(label, examples)| (label, examples.len())))
    }
}
