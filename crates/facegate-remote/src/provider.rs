//! Capability interface over a remote face recognition collection.

use async_trait::async_trait;
use facegate_core::DetectionResult;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("provider returned {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("deletion stopped after {} face(s): {source}", deleted.len())]
    PartialDelete {
        deleted: Vec<String>,
        #[source]
        source: Box<RemoteError>,
    },
}

impl RemoteError {
    /// Faces removed before the error, for partial-progress reporting.
    pub fn deleted(&self) -> &[String] {
        match self {
            RemoteError::PartialDelete { deleted, .. } => deleted,
            _ => &[],
        }
    }
}

/// A face held in the remote collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFace {
    pub face_id: String,
    /// Correlation id supplied when the face was indexed.
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDetection {
    pub region: DetectionResult,
    pub emotion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMatch {
    pub face: RemoteFace,
    /// Provider similarity normalised to [0, 1].
    pub similarity: f32,
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FacePage {
    pub faces: Vec<RemoteFace>,
    /// Cursor for the next page, `None` once the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Remote opinion on one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub detection: RemoteDetection,
    pub best_match: Option<RemoteMatch>,
}

#[async_trait]
pub trait RemoteRecognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn detect(&self, image: &[u8]) -> Result<Vec<RemoteDetection>, RemoteError>;

    /// Add the primary face of `image` to the collection; returns its face id.
    async fn index(&self, image: &[u8], correlation_id: &str) -> Result<String, RemoteError>;

    async fn search(&self, image: &[u8]) -> Result<Option<RemoteMatch>, RemoteError>;

    async fn list_faces(&self, cursor: Option<&str>) -> Result<FacePage, RemoteError>;

    /// Remove faces; returns the ids actually deleted. Deleting an absent face
    /// is not an error.
    async fn delete_faces(&self, face_ids: &[String]) -> Result<Vec<String>, RemoteError>;
}

/// Detect faces, then search the collection for the primary one.
///
/// No faces yields an empty list; the match is attached to the first
/// (largest) detection only.
pub async fn verify_remotely(provider: &dyn RemoteRecognizer, image: &[u8]) -> Result<Vec<RemoteOutcome>, RemoteError> {
    let mut detections = provider.detect(image).await?;
    if detections.is_empty() {
        return Ok(Vec::new());
    }
    detections.sort_by(|a, b| b.region.area().total_cmp(&a.region.area()));

    let best_match = provider.search(image).await?;
    Ok(detections
        .into_iter()
        .enumerate()
        .map(|(i, detection)| RemoteOutcome {
            detection,
            best_match: if i == 0 { best_match.clone() } else { None },
        })
        .collect())
}
