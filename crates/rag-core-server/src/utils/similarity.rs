use anyhow::Result;

/// Cosine similarity between two embedding vectors, clamped to [-1, 1].
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        anyhow::bail!("Vector dimensions must match: {} != {}", a.len(), b.len());
    }

    if a.is_empty() {
        anyhow::bail!("Vectors cannot be empty");
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();

    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return Ok(0.0);
    }

    Ok((dot_product / (magnitude_a * magnitude_b)).clamp(-1.0, 1.0))
}

/// Best cosine similarity of a query against a candidate set.
/// Mismatched or empty candidates are skipped rather than failing the scan.
pub fn max_cosine_similarity(query: &[f32], candidates: &[Vec<f32>]) -> f32 {
    candidates
        .iter()
        .filter_map(|c| cosine_similarity(query, c).ok())
        .fold(0.0_f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let a = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&a, &a).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        assert!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn zero_vector_scores_zero() {
        let sim = cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]).unwrap();
        assert_eq!(sim, 0.0);
    }

    #[test]
    fn max_over_candidates_picks_best_and_ignores_bad_dims() {
        let query = vec![1.0, 0.0];
        let candidates = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 0.0, 0.0]];
        let best = max_cosine_similarity(&query, &candidates);
        assert!((best - 1.0).abs() < 1e-6);
    }
}
