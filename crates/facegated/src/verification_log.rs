//! Persistent record of verification decisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use facegate_core::{DecisionSource, IdentityId, StoreError, VerificationOutcome};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationRecord {
    /// Set only when the decision authorized a known identity.
    pub identity_id: Option<IdentityId>,
    /// `local`, or the name of the remote provider that decided.
    pub provider: String,
    pub authorized: bool,
    pub confidence: f32,
    pub emotion: Option<String>,
    pub is_live: bool,
    pub timestamp: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn from_outcome(outcome: &VerificationOutcome, remote_provider: Option<&str>) -> Self {
        let provider = match outcome.source {
            DecisionSource::Local => "local",
            DecisionSource::Remote => remote_provider.unwrap_or("remote"),
        };
        Self {
            identity_id: outcome
                .identity
                .as_ref()
                .filter(|_| outcome.authorized)
                .map(|i| i.id.clone()),
            provider: provider.to_string(),
            authorized: outcome.authorized,
            confidence: outcome.similarity,
            emotion: outcome.emotion.clone(),
            is_live: outcome.is_live,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait VerificationLog: Send + Sync {
    async fn append(&self, record: &VerificationRecord) -> Result<(), StoreError>;

    /// Newest first, at most `limit` entries.
    async fn recent_for(&self, id: &IdentityId, limit: usize) -> Result<Vec<VerificationRecord>, StoreError>;
}
