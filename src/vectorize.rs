//! Stateless feature-hashing vectorizer.
//!
//! No fitted vocabulary and no corpus-wide document frequencies are ever
//! computed: every token is mapped directly into `[0, n_features)` by a
//! fixed hash function, so a vector produced today is bit-for-bit
//! comparable (up to floating point reproducibility) to one produced with
//! the same config a year from now. This is a deliberate simplification
//! from implementations that sometimes fit a TF-IDF vocabulary across the
//! corpus — see DESIGN.md's Open Question resolutions.

use std::collections::HashMap;

use unicode_normalization::char::decompose_canonical;

use crate::config::SimilarityConfig;

/// Canonical, round-trippable sparse vector representation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SparseVector {
    pub shape: [usize; 2],
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn dim(&self) -> usize {
        self.shape[1]
    }

    /// Expands to a dense `f32` vector of length `dim`, padding with zeros.
    /// Used at backends that require a dense representation (the KV+vector
    /// backend's server-side HNSW index).
    pub fn to_dense(&self, dim: usize) -> Vec<f32> {
        let mut dense = vec![0.0f32; dim];
        for (&idx, &val) in self.indices.iter().zip(self.values.iter()) {
            if (idx as usize) < dim {
                dense[idx as usize] = val;
            }
        }
        dense
    }

    pub fn from_dense(dense: &[f32]) -> Self {
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for (i, &v) in dense.iter().enumerate() {
            if v != 0.0 {
                indices.push(i as u32);
                values.push(v);
            }
        }
        Self {
            shape: [1, dense.len()],
            indices,
            values,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("sparse vector serialization cannot fail")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    pub fn l2_norm(&self) -> f64 {
        self.values.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt()
    }
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is", "it",
    "its", "of", "on", "that", "the", "to", "was", "were", "will", "with", "this", "but", "they",
    "have", "had", "what", "when", "where", "who", "which", "why", "how", "or", "not", "no", "so",
    "if", "then", "than", "we", "you", "your", "their", "them", "i", "my", "me", "do", "does",
    "did", "can", "could", "should", "would", "about", "into", "over", "under", "again", "there",
    "here", "all", "any", "each", "few", "more", "most", "other", "some", "such", "only", "own",
    "same", "too", "very", "just", "also",
];

fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

fn strip_accents(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let mut base = None;
        decompose_canonical(c, |decomposed| {
            if base.is_none() && !is_combining_mark(decomposed) {
                base = Some(decomposed);
            }
        });
        out.push(base.unwrap_or(c));
    }
    out
}

fn is_combining_mark(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F)
}

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let stripped = strip_accents(&lowered);
    stripped
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .filter(|s| !is_stopword(s))
        .collect()
}

fn ngrams(tokens: &[String], n_min: usize, n_max: usize) -> Vec<String> {
    let mut grams = Vec::new();
    let n_min = n_min.max(1);
    let n_max = n_max.max(n_min);
    for n in n_min..=n_max {
        if n > tokens.len() {
            continue;
        }
        for window in tokens.windows(n) {
            grams.push(window.join(" "));
        }
    }
    grams
}

/// FNV-1a 64-bit — fixed, non-randomized, stable across processes and
/// releases, unlike `std::collections::hash_map::DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn strip_for_length_check(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Produces an L2-normalized sparse feature vector from `text`, or `None`
/// if the whitespace-collapsed text is shorter than
/// `config.min_content_length`.
pub fn vectorize(text: &str, config: &SimilarityConfig) -> Option<SparseVector> {
    vectorize_with_ngrams(text, config, config.ngram_range_min, config.ngram_range_max)
}

/// Vectorizes with an explicit n-gram range, used by the similarity
/// matcher's secondary-validation pass which widens the range without
/// otherwise changing the config.
pub fn vectorize_with_ngrams(
    text: &str,
    config: &SimilarityConfig,
    ngram_min: usize,
    ngram_max: usize,
) -> Option<SparseVector> {
    let stripped = strip_for_length_check(text);
    if stripped.len() < config.min_content_length {
        return None;
    }

    let tokens = tokenize(text);
    let grams = ngrams(&tokens, ngram_min, ngram_max);
    if grams.is_empty() {
        return None;
    }

    let mut buckets: HashMap<u32, f32> = HashMap::new();
    for gram in &grams {
        let idx = (fnv1a(gram.as_bytes()) % config.n_features as u64) as u32;
        *buckets.entry(idx).or_insert(0.0) += 1.0;
    }

    if config.sublinear_tf {
        for v in buckets.values_mut() {
            *v = 1.0 + v.ln();
        }
    }

    let norm: f32 = buckets.values().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in buckets.values_mut() {
            *v /= norm;
        }
    }

    let mut indices: Vec<u32> = buckets.keys().copied().collect();
    indices.sort_unstable();
    let values: Vec<f32> = indices.iter().map(|i| buckets[i]).collect();

    Some(SparseVector {
        shape: [1, config.n_features],
        indices,
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SensitivityPreset;

    fn cfg() -> SimilarityConfig {
        SimilarityConfig::for_preset(SensitivityPreset::Medium)
    }

    #[test]
    fn short_text_yields_no_vector() {
        let c = cfg();
        assert!(vectorize("too short", &c).is_none());
    }

    #[test]
    fn long_text_yields_normalized_vector_of_configured_dimension() {
        let c = cfg();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let v = vectorize(&text, &c).unwrap();
        assert_eq!(v.dim(), c.n_features);
        assert!((v.l2_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn identical_text_yields_identical_vector() {
        let c = cfg();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let v1 = vectorize(&text, &c).unwrap();
        let v2 = vectorize(&text, &c).unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn wire_format_round_trips() {
        let c = cfg();
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(5);
        let v = vectorize(&text, &c).unwrap();
        let bytes = v.to_bytes();
        let back = SparseVector::from_bytes(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn dense_round_trip_preserves_nonzero_entries() {
        let sv = SparseVector {
            shape: [1, 8],
            indices: vec![1, 5],
            values: vec![0.6, 0.8],
        };
        let dense = sv.to_dense(8);
        let back = SparseVector::from_dense(&dense);
        assert_eq!(back.indices, sv.indices);
        assert_eq!(back.values, sv.values);
    }

    #[test]
    fn boundary_min_content_length() {
        let mut c = cfg();
        c.min_content_length = 10;
        assert!(vectorize("0123456789", &c).is_some());
        assert!(vectorize("012345678", &c).is_none());
    }
}
