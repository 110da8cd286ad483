//! Rank-based attribution weights for retrieved context passages.
//!
//! Feedback on an answer is split across the passages that grounded it.
//! Earlier ranks carry more of the credit: raw weight 1/rank, normalized so
//! the shares sum to one.

/// Attribution shares for `count` ranked passages, best rank first.
///
/// Returns an empty vector for zero passages and `[1.0]` for a single one.
/// Shares are strictly decreasing and sum to one.
pub fn attribution_weights(count: usize) -> Vec<f64> {
    if count == 0 {
        return Vec::new();
    }

    let raw: Vec<f64> = (1..=count).map(|rank| 1.0 / rank as f64).collect();
    let total: f64 = raw.iter().sum();
    raw.into_iter().map(|weight| weight / total).collect()
}

/// Map a KNN distance to a relevance score in `(0, 1]`.
///
/// Distance zero is a perfect match. Non-finite or negative distances score
/// zero rather than poisoning downstream ranking.
pub fn distance_to_score(distance: f32) -> f32 {
    if !distance.is_finite() || distance < 0.0 {
        return 0.0;
    }
    (1.0 / (1.0 + distance)).clamp(0.0, 1.0)
}
