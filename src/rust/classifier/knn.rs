use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::embedding::Embedding;
use super::error::ClassifierError;
use super::store::{ClassLabel, ExemplarStore};
use super::utils::{cosine_similarity, normalize_vector};

/// Neighbours at least this similar are treated as the query itself.
const IDENTITY_THRESHOLD: f64 = 1.0 - 1e-9;

/// Per-class confidence, keyed in ascending label order.
///
/// Values lie in [0,1] and sum to 1 over the classes present in the store at
/// query time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDistribution(BTreeMap<ClassLabel, f64>);

impl ConfidenceDistribution {
    pub fn get(&self, label: ClassLabel) -> Option<f64> {
        self.0.get(&label).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassLabel, f64)> + '_ {
        self.0.iter().map(|(label, p)| (*label, *p))
    }

    /// The most confident class; equal confidences resolve to the lower label.
    pub fn top(&self) -> Option<(ClassLabel, f64)> {
        self.iter().fold(None, |best, (label, p)| match best {
            Some((_, best_p)) if best_p >= p => best,
            _ => Some((label, p)),
        })
    }

    /// Entries sorted by descending confidence, ties by ascending label.
    pub fn ranked(&self) -> Vec<(ClassLabel, f64)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
        entries
    }
}

/// Similarity-weighted k-nearest-neighbour vote over an [`ExemplarStore`].
///
/// The query is compared with every exemplar by cosine similarity. The `k` most
/// similar exemplars across all classes vote for their class with weight equal
/// to their similarity (negative similarities vote with weight 0), and the
/// per-class sums are normalised to 1. `k = None` lets every exemplar vote.
///
/// When a neighbour is identical in direction to the query, only such identical
/// neighbours vote, so a stored exemplar is always classified as its own class.
/// If every weight is 0 (zero-norm query, or orthogonal to everything) the mass
/// is split evenly over the non-empty classes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NearestNeighbor {
    k: Option<usize>,
}

struct Neighbor {
    label: ClassLabel,
    index: usize,
    similarity: f64,
}

impl NearestNeighbor {
    pub fn new(k: Option<usize>) -> Self {
        Self { k }
    }

    pub fn k(&self) -> Option<usize> {
        self.k
    }

    /// Classifies `query` against the store.
    ///
    /// Returns `Ok(None)` when the store holds no exemplars.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the query length differs from the store's dimension
    pub fn predict(
        &self,
        store: &ExemplarStore,
        query: &Embedding,
    ) -> Result<Option<ConfidenceDistribution>, ClassifierError> {
        self.predict_excluding(store, query, None)
    }

    /// Same as [`NearestNeighbor::predict`] but ignores one stored exemplar,
    /// which is how leave-one-out evaluation queries the store.
    pub fn predict_excluding(
        &self,
        store: &ExemplarStore,
        query: &Embedding,
        exclude: Option<(ClassLabel, usize)>,
    ) -> Result<Option<ConfidenceDistribution>, ClassifierError> {
        let dimension = match store.dimension() {
            Some(d) if !store.is_empty() => d,
            _ => return Ok(None),
        };
        if query.len() != dimension {
            return Err(ClassifierError::DimensionMismatch {
                expected: dimension,
                actual: query.len(),
            });
        }

        let mut neighbors = self.rank_neighbors(store, query, exclude);
        if let Some(k) = self.k {
            neighbors.truncate(k.max(1));
        }
        if neighbors.first().is_some_and(|n| n.similarity >= IDENTITY_THRESHOLD) {
            neighbors.retain(|n| n.similarity >= IDENTITY_THRESHOLD);
        }

        let mut weights: BTreeMap<ClassLabel, f64> = store.labels().map(|label| (label, 0.0)).collect();
        for neighbor in &neighbors {
            if let Some(weight) = weights.get_mut(&neighbor.label) {
                *weight += neighbor.similarity.max(0.0);
            }
        }

        let total: f64 = weights.values().sum();
        if total > 0.0 && total.is_finite() {
            for weight in weights.values_mut() {
                *weight /= total;
            }
        } else {
            let voters: Vec<ClassLabel> = store
                .iter()
                .filter(|(label, examples)| {
                    let available = match exclude {
                        Some((excluded, _)) if excluded == *label => examples.len().saturating_sub(1),
                        _ => examples.len(),
                    };
                    available > 0
                })
                .map(|(label, _)| label)
                .collect();
            if voters.is_empty() {
                return Ok(None);
            }
            let share = 1.0 / voters.len() as f64;
            for weight in weights.values_mut() {
                *weight = 0.0;
            }
            for label in voters {
                weights.insert(label, share);
            }
        }

        Ok(Some(ConfidenceDistribution(weights)))
    }

    /// All exemplars with their similarity to the query, most similar first.
    /// Equal similarities keep label then index order, which makes the top-k cut
    /// deterministic.
    fn rank_neighbors(
        &self,
        store: &ExemplarStore,
        query: &Embedding,
        exclude: Option<(ClassLabel, usize)>,
    ) -> Vec<Neighbor> {
        let query = normalize_vector(query);
        let mut neighbors = Vec::with_capacity(store.total_examples());
        for (label, examples) in store.iter() {
            for (index, exemplar) in examples.iter().enumerate() {
                if exclude == Some((label, index)) {
                    continue;
                }
                let similarity = match (&query, normalize_vector(exemplar)) {
                    (Some(q), Some(e)) => cosine_similarity(q, &e),
                    _ => 0.0,
                };
                neighbors.push(Neighbor {
                    label,
                    index,
                    similarity,
                });
            }
        }
        neighbors.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then(a.label.cmp(&b.label))
                .then(a.index.cmp(&b.index))
        });
        neighbors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn store_with(entries: &[(u32, Embedding)]) -> ExemplarStore {
        let mut store = ExemplarStore::new();
        for (label, embedding) in entries {
            store.add_example(ClassLabel(*label), embedding.clone()).unwrap();
        }
        store
    }

    #[test]
    fn test_empty_store_returns_none() {
        let store = ExemplarStore::new();
        let result = NearestNeighbor::default().predict(&store, &array![1.0, 0.0]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_weighted_vote_normalises() {
        let store = store_with(&[
            (0, array![1.0, 0.0]),
            (0, array![0.8, 0.6]),
            (1, array![0.0, 1.0]),
        ]);
        let dist = NearestNeighbor::default()
            .predict(&store, &array![0.6, 0.8])
            .unwrap()
            .unwrap();
        // Similarities: 0.6, 0.96, 0.8
        let a = dist.get(ClassLabel(0)).unwrap();
        let b = dist.get(ClassLabel(1)).unwrap();
        assert!((a - 1.56 / 2.36).abs() < 1e-6);
        assert!((b - 0.8 / 2.36).abs() < 1e-6);
        assert_eq!(dist.top().unwrap().0, ClassLabel(0));
    }

    #[test]
    fn test_top_k_limits_voters() {
        let store = store_with(&[
            (0, array![1.0, 0.0]),
            (1, array![0.9, 0.1]),
            (1, array![0.8, 0.2]),
        ]);
        let query = array![0.95, 0.05];

        // Two close neighbours outvote one closer neighbour when everyone votes
        let all = NearestNeighbor::default().predict(&store, &query).unwrap().unwrap();
        assert_eq!(all.top().unwrap().0, ClassLabel(1));

        let nearest = NearestNeighbor::new(Some(1)).predict(&store, &query).unwrap().unwrap();
        assert_eq!(nearest.get(ClassLabel(0)), Some(1.0));
        assert_eq!(nearest.get(ClassLabel(1)), Some(0.0));
    }

    #[test]
    fn test_zero_norm_query_splits_evenly() {
        let store = store_with(&[(0, array![1.0, 0.0]), (3, array![0.0, 1.0])]);
        let dist = NearestNeighbor::default()
            .predict(&store, &array![0.0, 0.0])
            .unwrap()
            .unwrap();
        assert_eq!(dist.get(ClassLabel(0)), Some(0.5));
        assert_eq!(dist.get(ClassLabel(3)), Some(0.5));
        assert_eq!(dist.top().unwrap().0, ClassLabel(0));
    }

    #[test]
    fn test_nan_query_splits_evenly() {
        let store = store_with(&[(0, array![1.0, 0.0]), (1, array![0.0, 1.0])]);
        let dist = NearestNeighbor::default()
            .predict(&store, &array![f32::NAN, 1.0])
            .unwrap()
            .unwrap();
        assert_eq!(dist.get(ClassLabel(0)), Some(0.5));
        assert_eq!(dist.get(ClassLabel(1)), Some(0.5));
        assert!(dist.iter().all(|(_, p)| p.is_finite()));
    }

    #[test]
    fn test_query_dimension_checked() {
        let store = store_with(&[(0, array![1.0, 0.0])]);
        let err = NearestNeighbor::default()
            .predict(&store, &array![1.0, 0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, ClassifierError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_ranked_orders_by_confidence_then_label() {
        let mut map = BTreeMap::new();
        map.insert(ClassLabel(2), 0.25);
        map.insert(ClassLabel(0), 0.25);
        map.insert(ClassLabel(1), 0.5);
        let dist = ConfidenceDistribution(map);
        let labels: Vec<_> = dist.ranked().into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels, vec![ClassLabel(1), ClassLabel(0), ClassLabel(2)]);
    }
}
