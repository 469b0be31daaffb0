use ndarray::Array1;

const NORM_EPSILON: f64 = 1e-10;

/// Returns the unit vector in f64, or `None` for zero-norm or non-finite input.
pub(crate) fn normalize_vector(vec: &Array1<f32>) -> Option<Array1<f64>> {
    let wide = vec.mapv(f64::from);
    let norm = wide.dot(&wide).sqrt();
    if norm.is_finite() && norm > NORM_EPSILON {
        Some(wide / norm)
    } else {
        None
    }
}

/// Cosine similarity of two already normalised vectors.
/// Anything that is not a finite number collapses to 0.
pub(crate) fn cosine_similarity(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let sim = a.dot(b);
    if sim.is_finite() {
        sim.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize_vector(&array![3.0f32, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-12);
        assert!((v[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_zero_and_nan_vectors() {
        assert!(normalize_vector(&array![0.0f32, 0.0]).is_none());
        assert!(normalize_vector(&array![f32::NAN, 1.0]).is_none());
        assert!(normalize_vector(&array![f32::INFINITY, 1.0]).is_none());
    }

    #[test]
    fn test_cosine_similarity_self() {
        let v = normalize_vector(&array![0.2f32, -0.7, 1.3]).unwrap();
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-12);
    }
}
