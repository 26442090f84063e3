// crates/lore-server/src/search/hybrid.rs
// Rank fusion over the two scored streams. The store runs the FTS and
// vector queries concurrently and hands the raw scores here; fusion itself
// is pure so it can be tested without a database.

use lore_types::Observation;
use serde::Serialize;

/// Default fusion weights.
pub const DEFAULT_FTS_WEIGHT: f64 = 0.5;
pub const DEFAULT_VECTOR_WEIGHT: f64 = 0.5;

/// One candidate entering fusion: raw scores from whichever streams saw it,
/// plus the tiebreak fields.
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub id: i64,
    /// Raw text relevance (negated bm25; higher is better). None when the
    /// FTS stream did not return this id.
    pub fts_score: Option<f64>,
    /// Raw vector similarity (1 - cosine distance). None when the vector
    /// stream did not return this id.
    pub vector_score: Option<f64>,
    pub importance: f64,
    pub created_at_epoch: i64,
}

/// A fused id with its final score, ready for hydration in rank order.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedId {
    pub id: i64,
    pub score: f64,
}

/// A hydrated search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub observation: Observation,
    /// Fused score in [0, 1].
    pub score: f64,
}

/// Min-max normalize the present values of one stream to [0, 1].
/// A degenerate stream (all values equal) normalizes to 1.0: presence in a
/// stream is still a signal even when it cannot be ranked within it.
fn normalize<F>(candidates: &[FusionCandidate], get: F) -> Vec<Option<f64>>
where
    F: Fn(&FusionCandidate) -> Option<f64>,
{
    let present: Vec<f64> = candidates.iter().filter_map(&get).collect();
    if present.is_empty() {
        return vec![None; candidates.len()];
    }
    let min = present.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = present.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    candidates
        .iter()
        .map(|c| {
            get(c).map(|v| {
                if range > f64::EPSILON {
                    (v - min) / range
                } else {
                    1.0
                }
            })
        })
        .collect()
}

/// Fuse the two streams: each normalized by min-max, combined with the
/// given weights (a missing stream contributes 0). Ties break by importance
/// then recency. Returns the top `limit` ids, best first.
pub fn fuse_ranked(
    candidates: Vec<FusionCandidate>,
    w_fts: f64,
    w_vec: f64,
    limit: usize,
) -> Vec<FusedId> {
    if candidates.is_empty() || limit == 0 {
        return Vec::new();
    }

    let fts_norm = normalize(&candidates, |c| c.fts_score);
    let vec_norm = normalize(&candidates, |c| c.vector_score);

    let mut scored: Vec<(FusedId, f64, i64)> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let score =
                w_fts * fts_norm[i].unwrap_or(0.0) + w_vec * vec_norm[i].unwrap_or(0.0);
            (FusedId { id: c.id, score }, c.importance, c.created_at_epoch)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.score
            .partial_cmp(&a.0.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(b.2.cmp(&a.2))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|(fused, _, _)| fused)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(
        id: i64,
        fts: Option<f64>,
        vec: Option<f64>,
        importance: f64,
        created: i64,
    ) -> FusionCandidate {
        FusionCandidate {
            id,
            fts_score: fts,
            vector_score: vec,
            importance,
            created_at_epoch: created,
        }
    }

    #[test]
    fn both_streams_beat_single_stream() {
        let fused = fuse_ranked(
            vec![
                candidate(1, Some(2.0), Some(0.9), 1.0, 0),
                candidate(2, Some(5.0), None, 1.0, 0),
                candidate(3, None, Some(0.95), 1.0, 0),
            ],
            DEFAULT_FTS_WEIGHT,
            DEFAULT_VECTOR_WEIGHT,
            10,
        );
        // 2 and 3 each top one stream (norm 1.0 -> 0.5 fused); 1 is mid-FTS
        // but present in both, so it can compete. The single best fused id
        // must be one of the stream winners here.
        assert_eq!(fused.len(), 3);
        assert!(fused[0].score >= fused[1].score);
        assert!(fused[1].score >= fused[2].score);
    }

    #[test]
    fn normalization_is_min_max() {
        let fused = fuse_ranked(
            vec![
                candidate(1, Some(10.0), None, 1.0, 0),
                candidate(2, Some(5.0), None, 1.0, 0),
                candidate(3, Some(0.0), None, 1.0, 0),
            ],
            0.5,
            0.5,
            10,
        );
        assert_eq!(fused[0].id, 1);
        assert!((fused[0].score - 0.5).abs() < 1e-9); // 0.5 * 1.0
        assert!((fused[1].score - 0.25).abs() < 1e-9); // 0.5 * 0.5
        assert!(fused[2].score.abs() < 1e-9);
    }

    #[test]
    fn degenerate_stream_counts_as_presence() {
        let fused = fuse_ranked(
            vec![
                candidate(1, Some(3.0), None, 1.0, 0),
                candidate(2, Some(3.0), None, 1.0, 0),
            ],
            0.5,
            0.5,
            10,
        );
        assert!((fused[0].score - 0.5).abs() < 1e-9);
        assert!((fused[1].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_importance_then_recency() {
        let fused = fuse_ranked(
            vec![
                candidate(1, Some(1.0), None, 1.0, 100),
                candidate(2, Some(1.0), None, 3.0, 50),
                candidate(3, Some(1.0), None, 3.0, 200),
            ],
            0.5,
            0.5,
            10,
        );
        let ids: Vec<i64> = fused.iter().map(|f| f.id).collect();
        // All scores tie at 0.5: importance 3.0 wins, newer first within it
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn limit_truncates_after_ranking() {
        let fused = fuse_ranked(
            vec![
                candidate(1, Some(1.0), None, 1.0, 0),
                candidate(2, Some(9.0), None, 1.0, 0),
                candidate(3, Some(5.0), None, 1.0, 0),
            ],
            1.0,
            0.0,
            2,
        );
        let ids: Vec<i64> = fused.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(fuse_ranked(vec![], 0.5, 0.5, 10).is_empty());
    }
}
