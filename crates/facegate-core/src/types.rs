use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Face region found by a detector, in original frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl DetectionResult {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Clamp the region so it lies entirely inside a `width` × `height` image.
    pub fn clamp_to(&mut self, width: u32, height: u32) {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = (self.x + self.width).clamp(0.0, w);
        let y2 = (self.y + self.height).clamp(0.0, h);
        self.x = x1;
        self.y = y1;
        self.width = (x2 - x1).max(0.0);
        self.height = (y2 - y1).max(0.0);
    }
}

/// Errors raised when comparing embeddings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Face embedding vector. A point in a metric space, never read positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50", "grid-stats-v1").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Returns 0 when either vector is all zeros. Vectors of different length
    /// are a [`MatchError::DimensionMismatch`], never a silent zero.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> Result<f32, MatchError> {
        if self.values.len() != other.values.len() {
            return Err(MatchError::DimensionMismatch {
                left: self.values.len(),
                right: other.values.len(),
            });
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = if denom > 0.0 { dot / denom } else { 0.0 };
        Ok(sim.clamp(-1.0, 1.0))
    }

    /// Return an L2-normalized copy. Zero vectors are returned unchanged.
    pub fn normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in self.values.iter_mut() {
                *v /= norm;
            }
        }
        self
    }
}

/// Stable identifier of a [`FaceIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdentityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdentityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A registered person and their stored face template.
///
/// The remote cross-references (`remote_face_id`, `correlation_id`) are each
/// unique across the store when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceIdentity {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    pub embedding: Embedding,
    /// Face id assigned by the remote provider's collection.
    pub remote_face_id: Option<String>,
    /// External correlation id handed to the provider at index time.
    pub correlation_id: Option<String>,
    pub image_url: Option<String>,
    pub image_key: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FaceIdentity {
    pub fn new(id: IdentityId, name: impl Into<String>, email: impl Into<String>, embedding: Embedding) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            email: email.into(),
            embedding,
            remote_face_id: None,
            correlation_id: None,
            image_url: None,
            image_key: None,
            department: None,
            position: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Stored templates used for matching. Currently exactly one.
    pub fn templates(&self) -> impl Iterator<Item = &Embedding> {
        std::iter::once(&self.embedding)
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            remote_face_id: self.remote_face_id.clone(),
            correlation_id: self.correlation_id.clone(),
            active: self.active,
        }
    }
}

/// Template-free view of an identity, safe to hand to callers and reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    pub remote_face_id: Option<String>,
    pub correlation_id: Option<String>,
    pub active: bool,
}

/// Identity reference carried by match and verification results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedIdentity {
    pub id: IdentityId,
    pub name: String,
}

impl From<&FaceIdentity> for MatchedIdentity {
    fn from(identity: &FaceIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
        }
    }
}

/// Result of matching a query embedding against a set of candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Best-scoring candidate, `None` when there were no candidates.
    pub candidate: Option<MatchedIdentity>,
    /// Cosine similarity of the best candidate [-1, 1], 0 when there was none.
    pub similarity: f32,
}

/// Which path produced a verification decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Local,
    Remote,
}

/// Per-frame verification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub authorized: bool,
    pub identity: Option<MatchedIdentity>,
    pub similarity: f32,
    /// Threshold the similarity was compared against.
    pub threshold: f32,
    /// Local liveness score, 0–100.
    pub liveness_score: f32,
    pub is_live: bool,
    pub emotion: Option<String>,
    pub moving: bool,
    pub face: Option<DetectionResult>,
    pub source: DecisionSource,
    pub message: Option<String>,
}

impl VerificationOutcome {
    /// Negative outcome for a frame in which no face was found.
    pub fn no_face(source: DecisionSource) -> Self {
        Self {
            authorized: false,
            identity: None,
            similarity: 0.0,
            threshold: 0.0,
            liveness_score: 0.0,
            is_live: false,
            emotion: None,
            moving: false,
            face: None,
            source,
            message: Some("no face detected".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&b).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[0.0, 1.0]);
        assert!(a.similarity(&b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[-1.0, 0.0]);
        assert!((a.similarity(&b).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(a.similarity(&b).unwrap(), 0.0);
        assert!(a.is_zero());
    }

    #[test]
    fn test_cosine_similarity_symmetric_and_self_one() {
        let vectors = [
            emb(&[0.3, -1.2, 4.0, 0.01]),
            emb(&[2.0, 2.0, -2.0, 9.5]),
            emb(&[-0.7, 0.0, 0.0, 1.0]),
        ];
        for a in &vectors {
            assert!((a.similarity(a).unwrap() - 1.0).abs() < 1e-5);
            for b in &vectors {
                let ab = a.similarity(b).unwrap();
                let ba = b.similarity(a).unwrap();
                assert!((ab - ba).abs() < 1e-6, "{ab} != {ba}");
            }
        }
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let a = emb(&[1.0, 0.0, 0.0]);
        let b = emb(&[1.0, 0.0]);
        assert_eq!(
            a.similarity(&b),
            Err(MatchError::DimensionMismatch { left: 3, right: 2 })
        );
    }

    #[test]
    fn test_normalized() {
        let n = emb(&[3.0, 4.0]).normalized();
        assert!((n.values[0] - 0.6).abs() < 1e-6);
        assert!((n.values[1] - 0.8).abs() < 1e-6);
        assert!(emb(&[0.0, 0.0]).normalized().is_zero());
    }

    #[test]
    fn test_clamp_to_image_bounds() {
        let mut det = DetectionResult::new(-10.0, 20.0, 100.0, 500.0, 0.9);
        det.clamp_to(80, 200);
        assert_eq!(det.x, 0.0);
        assert_eq!(det.width, 80.0);
        assert_eq!(det.y, 20.0);
        assert_eq!(det.height, 180.0);
    }
}
