//! Pluggable query/candidate scoring.
//!
//! How similarity is computed is the caller's business; the strategies only
//! need a score in `[0, 1]`.  [`KeywordSimilarity`] is the built-in default.

use super::keywords::extract_keywords;

pub trait Similarity: Send + Sync {
    fn name(&self) -> &str;

    /// Score `candidate` against `query`.  Higher is more similar; the
    /// result is within `[0, 1]`.
    fn score(&self, query: &str, candidate: &str) -> f32;
}

/// Fraction of query keywords present in the candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordSimilarity;

impl Similarity for KeywordSimilarity {
    fn name(&self) -> &str {
        "keyword-overlap"
    }

    fn score(&self, query: &str, candidate: &str) -> f32 {
        let q = extract_keywords(query);
        if q.is_empty() {
            return 0.0;
        }
        let c = extract_keywords(candidate);
        let hits = q.intersection(&c).count();
        hits as f32 / q.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_overlap_scores_one() {
        let s = KeywordSimilarity;
        assert!((s.score("rust ownership", "Ownership in Rust explained") - 1.0).abs() < 1e-6);
    }

    #[test]
    fn partial_overlap_is_fractional() {
        let s = KeywordSimilarity;
        let score = s.score("rust ownership borrowing", "Rust has ownership");
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn empty_query_scores_zero() {
        assert_eq!(KeywordSimilarity.score("the a of", "anything"), 0.0);
    }
}
