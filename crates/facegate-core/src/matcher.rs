//! Similarity matching of a query embedding against enrolled identities.

use crate::types::{Embedding, FaceIdentity, MatchError, MatchResult, MatchedIdentity};

pub trait SimilarityMatcher: Send + Sync {
    /// Similarity of two embeddings, 1 for identical direction.
    fn score(&self, a: &Embedding, b: &Embedding) -> Result<f32, MatchError>;

    /// Highest-scoring active identity. Ties keep the earliest candidate.
    fn best_match(&self, query: &Embedding, candidates: &[FaceIdentity]) -> Result<MatchResult, MatchError>;

    fn is_authorized(&self, score: f32, threshold: f32) -> bool {
        score >= threshold
    }
}

/// Cosine-similarity matcher with a linear scan over every candidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineMatcher;

impl SimilarityMatcher for CosineMatcher {
    fn score(&self, a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
        a.similarity(b)
    }

    fn best_match(&self, query: &Embedding, candidates: &[FaceIdentity]) -> Result<MatchResult, MatchError> {
        let mut best: Option<(&FaceIdentity, f32)> = None;

        for identity in candidates.iter().filter(|c| c.active) {
            for template in identity.templates() {
                let sim = self.score(query, template)?;
                match best {
                    Some((_, top)) if sim <= top => {}
                    _ => best = Some((identity, sim)),
                }
            }
        }

        Ok(match best {
            Some((identity, similarity)) => MatchResult {
                candidate: Some(MatchedIdentity::from(identity)),
                similarity,
            },
            None => MatchResult {
                candidate: None,
                similarity: 0.0,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityId;

    fn identity(id: &str, values: &[f32]) -> FaceIdentity {
        FaceIdentity::new(
            IdentityId::from(id),
            id,
            format!("{id}@example.com"),
            Embedding { values: values.to_vec(), model_version: None },
        )
    }

    fn query(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_best_match_picks_highest() {
        let gallery = vec![
            identity("alice", &[1.0, 0.0, 0.0]),
            identity("bob", &[0.0, 1.0, 0.0]),
            identity("carol", &[0.7, 0.7, 0.0]),
        ];
        let result = CosineMatcher.best_match(&query(&[0.1, 1.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.candidate.unwrap().id.as_str(), "bob");
        assert!(result.similarity > 0.99);
    }

    #[test]
    fn test_best_match_empty_gallery() {
        let result = CosineMatcher.best_match(&query(&[1.0, 0.0]), &[]).unwrap();
        assert!(result.candidate.is_none());
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_best_match_skips_inactive() {
        let mut alice = identity("alice", &[1.0, 0.0]);
        alice.active = false;
        let gallery = vec![alice, identity("bob", &[0.0, 1.0])];
        let result = CosineMatcher.best_match(&query(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.candidate.unwrap().id.as_str(), "bob");
        assert!(result.similarity.abs() < 1e-6);
    }

    #[test]
    fn test_tie_keeps_first() {
        let gallery = vec![identity("first", &[1.0, 0.0]), identity("second", &[1.0, 0.0])];
        let result = CosineMatcher.best_match(&query(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.candidate.unwrap().id.as_str(), "first");
    }

    #[test]
    fn test_dimension_mismatch_propagates() {
        let gallery = vec![identity("alice", &[1.0, 0.0, 0.0])];
        assert!(matches!(
            CosineMatcher.best_match(&query(&[1.0, 0.0]), &gallery),
            Err(MatchError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_query_scores_zero() {
        let gallery = vec![identity("alice", &[1.0, 0.0])];
        let result = CosineMatcher.best_match(&query(&[0.0, 0.0]), &gallery).unwrap();
        assert_eq!(result.similarity, 0.0);
    }

    #[test]
    fn test_is_authorized_boundary() {
        assert!(CosineMatcher.is_authorized(0.8, 0.8));
        assert!(!CosineMatcher.is_authorized(0.7999, 0.8));
    }
}
