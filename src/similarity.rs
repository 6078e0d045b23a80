//! Cosine similarity matcher: batched scoring against a preloaded matrix,
//! threshold-ladder match-kind assignment, optional secondary n-gram
//! cross-validation.
//!
//! Grounded on the scan-time scoring algorithm: primary pass at the
//! configured n-gram range, an optional secondary pass at a widened range
//! gated on content length and a `require_multiple_matches` flag, combined
//! score is the mean of the two passes, top-5 cap.

use ndarray::{Array1, Array2};

use crate::config::SimilarityConfig;
use crate::vectorize::{vectorize_with_ngrams, SparseVector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    HighConfidence,
    Similarity,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::HighConfidence => "high_confidence",
            MatchKind::Similarity => "similarity",
        }
    }
}

pub fn classify_score(score: f64, config: &SimilarityConfig) -> MatchKind {
    if score >= config.exact_match_threshold {
        MatchKind::Exact
    } else if score >= config.high_confidence_threshold {
        MatchKind::HighConfidence
    } else {
        MatchKind::Similarity
    }
}

#[derive(Debug, Clone)]
pub struct SimilarityMatch {
    pub index: usize,
    pub score: f64,
    pub kind: MatchKind,
}

/// A preassembled dense matrix of indexed vectors, built once per scan and
/// shared immutably across all scanning workers.
pub struct VectorMatrix {
    matrix: Array2<f32>,
    dim: usize,
}

impl VectorMatrix {
    pub fn from_sparse(vectors: &[SparseVector], dim: usize) -> Self {
        let rows = vectors.len();
        let mut matrix = Array2::<f32>::zeros((rows, dim));
        for (r, v) in vectors.iter().enumerate() {
            for (&idx, &val) in v.indices.iter().zip(v.values.iter()) {
                if (idx as usize) < dim {
                    matrix[[r, idx as usize]] = val;
                }
            }
        }
        Self { matrix, dim }
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.nrows() == 0
    }

    pub fn len(&self) -> usize {
        self.matrix.nrows()
    }

    fn cosine_against(&self, query: &SparseVector) -> Array1<f64> {
        let dense_query = query.to_dense(self.dim);
        let query_arr = Array1::from(dense_query.into_iter().map(|v| v as f64).collect::<Vec<_>>());
        let query_norm = query_arr.dot(&query_arr).sqrt();
        if query_norm == 0.0 {
            return Array1::zeros(self.matrix.nrows());
        }
        let mut scores = Array1::<f64>::zeros(self.matrix.nrows());
        for r in 0..self.matrix.nrows() {
            let row = self.matrix.row(r);
            let mut dot = 0.0f64;
            let mut row_norm = 0.0f64;
            for (a, b) in row.iter().zip(query_arr.iter()) {
                dot += (*a as f64) * b;
                row_norm += (*a as f64).powi(2);
            }
            let row_norm = row_norm.sqrt();
            scores[r] = if row_norm == 0.0 { 0.0 } else { dot / (row_norm * query_norm) };
        }
        scores
    }
}

/// Runs the full matching algorithm (primary pass, optional secondary
/// validation pass) for one candidate's raw text against a preloaded
/// matrix, returning at most the top 5 surviving matches sorted by score
/// descending.
pub fn find_matches(text: &str, matrix: &VectorMatrix, config: &SimilarityConfig) -> Vec<SimilarityMatch> {
    if matrix.is_empty() {
        return Vec::new();
    }
    let Some(primary_vec) = vectorize_with_ngrams(text, config, config.ngram_range_min, config.ngram_range_max)
    else {
        return Vec::new();
    };

    let primary_scores = matrix.cosine_against(&primary_vec);

    let widened_min = config.ngram_range_min.saturating_sub(1).max(1);
    let widened_max = (config.ngram_range_max + 1).min(5);
    let widening_differs = widened_min != config.ngram_range_min || widened_max != config.ngram_range_max;
    let run_secondary = config.require_multiple_matches && text.chars().count() >= 200 && widening_differs;

    let secondary_scores = if run_secondary {
        vectorize_with_ngrams(text, config, widened_min, widened_max).map(|v| matrix.cosine_against(&v))
    } else {
        None
    };

    let mut candidates: Vec<SimilarityMatch> = Vec::new();
    for i in 0..primary_scores.len() {
        let primary = primary_scores[i];
        if primary < config.similarity_threshold {
            continue;
        }
        let final_score = if let Some(secondary_scores) = &secondary_scores {
            let secondary = secondary_scores[i];
            if secondary < 0.8 * config.similarity_threshold {
                continue;
            }
            (primary + secondary) / 2.0
        } else {
            primary
        };
        candidates.push(SimilarityMatch {
            index: i,
            score: final_score,
            kind: classify_score(final_score, config),
        });
    }

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
    candidates.truncate(5);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensitivityPreset;
    use crate::vectorize::vectorize;

    fn cfg() -> SimilarityConfig {
        SimilarityConfig::for_preset(SensitivityPreset::Medium)
    }

    #[test]
    fn classify_score_thresholds() {
        let c = cfg();
        assert_eq!(classify_score(c.exact_match_threshold, &c), MatchKind::Exact);
        assert_eq!(classify_score(c.exact_match_threshold - 0.001, &c), MatchKind::HighConfidence);
        assert_eq!(classify_score(c.high_confidence_threshold, &c), MatchKind::HighConfidence);
        assert_eq!(classify_score(c.similarity_threshold, &c), MatchKind::Similarity);
    }

    #[test]
    fn identical_text_scores_near_one() {
        let c = cfg();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let indexed = vectorize(&text, &c).unwrap();
        let matrix = VectorMatrix::from_sparse(&[indexed], c.n_features);
        let matches = find_matches(&text, &matrix, &c);
        assert_eq!(matches.len(), 1);
        assert!(matches[0].score > 0.98);
    }

    #[test]
    fn unrelated_text_yields_no_match() {
        let c = cfg();
        let a = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let b = "Completely different subject matter about quantum physics and particle decay rates. ".repeat(5);
        let indexed = vectorize(&a, &c).unwrap();
        let matrix = VectorMatrix::from_sparse(&[indexed], c.n_features);
        let matches = find_matches(&b, &matrix, &c);
        assert!(matches.is_empty());
    }

    #[test]
    fn empty_matrix_yields_no_matches() {
        let c = cfg();
        let matrix = VectorMatrix::from_sparse(&[], c.n_features);
        let matches = find_matches("anything at all here", &matrix, &c);
        assert!(matches.is_empty());
    }

    #[test]
    fn results_capped_at_five_and_sorted_descending() {
        let c = cfg();
        let base = "The quick brown fox jumps over the lazy dog repeatedly near the river bank. ".repeat(4);
        let vectors: Vec<_> = (0..10).map(|_| vectorize(&base, &c).unwrap()).collect();
        let matrix = VectorMatrix::from_sparse(&vectors, c.n_features);
        let matches = find_matches(&base, &matrix, &c);
        assert!(matches.len() <= 5);
        for w in matches.windows(2) {
            assert!(w[0].score >= w[1].score);
        }
    }
}
