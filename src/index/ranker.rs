//! Nearest-neighbor ranking by cosine similarity.
//!
//! Always an exhaustive linear scan over the candidate population. That is
//! the right trade at personal-photo-library scale (thousands of entries);
//! anything web-scale would need a real ANN index.

use crate::photos::Photo;

/// Guards the denominator against degenerate all-zero vectors.
const NORM_EPSILON: f32 = 1e-10;

/// A ranked candidate.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Neighbor {
    pub uri: String,
    pub score: f32,
}

/// Cosine of the angle between two vectors, in [-1, 1].
///
/// A zero-norm input yields a score near 0 instead of dividing by zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt() + NORM_EPSILON)
}

/// Rank `photos` by similarity to `query`, most similar first, truncated
/// to `k` results.
///
/// Photos without an embedding are excluded from ranking entirely rather
/// than scored as 0. Ties keep input order (the sort is stable), so the
/// result is deterministic for a fixed population.
pub fn rank_by_similarity(query: &[f32], photos: &[Photo], k: usize) -> Vec<Neighbor> {
    let mut neighbors: Vec<Neighbor> = photos
        .iter()
        .filter_map(|photo| {
            let embedding = photo.embedding.as_deref()?;
            Some(Neighbor {
                uri: photo.uri.clone(),
                score: cosine_similarity(query, embedding),
            })
        })
        .collect();

    neighbors.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    neighbors.truncate(k);

    neighbors
}
