//! Silent template refresh after sustained high-confidence matches.
//!
//! Runs after the authorization decision. It never returns an error: a
//! failed write is logged and the counters are left in place so the next
//! qualifying match retries.

use crate::history::{HistoryStore, RollingStats};
use crate::store::IdentityStore;
use crate::types::{Embedding, IdentityId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    pub high_confidence: f32,
    pub min_attempts: u64,
    /// Weight of the newest sample in the rolling average.
    pub smoothing: f32,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.95,
            min_attempts: 5,
            smoothing: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImprovementOutcome {
    /// Confidence below the high-confidence bar; nothing recorded.
    Ignored,
    /// Sample recorded, template unchanged.
    Recorded(RollingStats),
    /// Stored embedding replaced and counters reset.
    TemplateRefreshed,
    /// Replacement was due but the write failed; counters kept.
    PersistFailed,
}

pub struct SelfImprovementTracker {
    config: ImprovementConfig,
    history: HistoryStore,
    store: Arc<dyn IdentityStore>,
}

impl SelfImprovementTracker {
    pub fn new(config: ImprovementConfig, store: Arc<dyn IdentityStore>) -> Self {
        let history = HistoryStore::new(config.smoothing);
        Self { config, history, store }
    }

    pub fn stats(&self, id: &IdentityId) -> Option<RollingStats> {
        self.history.get(id.as_str())
    }

    pub fn reset(&self, id: &IdentityId) -> bool {
        self.history.reset(id.as_str())
    }

    pub fn reset_all(&self) {
        self.history.clear();
    }

    /// Report a match of `id` at `confidence`, observed as `embedding`.
    pub async fn record_match(&self, id: &IdentityId, confidence: f32, embedding: &Embedding) -> ImprovementOutcome {
        if confidence < self.config.high_confidence {
            return ImprovementOutcome::Ignored;
        }

        let stats = self.history.record(id.as_str(), confidence);
        if stats.attempts < self.config.min_attempts || stats.average <= self.config.high_confidence {
            return ImprovementOutcome::Recorded(stats);
        }

        match self.store.update_embedding(id, embedding).await {
            Ok(()) => {
                self.history.reset(id.as_str());
                tracing::info!(user = %id, attempts = stats.attempts, average = stats.average, "face template refreshed");
                ImprovementOutcome::TemplateRefreshed
            }
            Err(e) => {
                tracing::warn!(user = %id, error = %e, "template refresh failed, will retry on next match");
                ImprovementOutcome::PersistFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryIdentityStore, StoreError};
    use crate::types::FaceIdentity;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose embedding writes fail while `failing` is set.
    struct FlakyStore {
        inner: MemoryIdentityStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl IdentityStore for FlakyStore {
        async fn find_by_id(&self, id: &IdentityId) -> Result<Option<FaceIdentity>, StoreError> {
            self.inner.find_by_id(id).await
        }
        async fn find_all(&self) -> Result<Vec<FaceIdentity>, StoreError> {
            self.inner.find_all().await
        }
        async fn find_by_email(&self, email: &str) -> Result<Option<FaceIdentity>, StoreError> {
            self.inner.find_by_email(email).await
        }
        async fn find_by_correlation_id(&self, c: &str) -> Result<Option<FaceIdentity>, StoreError> {
            self.inner.find_by_correlation_id(c).await
        }
        async fn find_by_remote_face_id(&self, f: &str) -> Result<Option<FaceIdentity>, StoreError> {
            self.inner.find_by_remote_face_id(f).await
        }
        async fn save(&self, identity: &FaceIdentity) -> Result<(), StoreError> {
            self.inner.save(identity).await
        }
        async fn delete(&self, id: &IdentityId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }
        async fn update_embedding(&self, id: &IdentityId, e: &Embedding) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.update_embedding(id, e).await
        }
        async fn update_remote_face_id(&self, id: &IdentityId, f: Option<&str>) -> Result<(), StoreError> {
            self.inner.update_remote_face_id(id, f).await
        }
    }

    fn emb(v: f32) -> Embedding {
        Embedding::new(vec![v, 1.0], "test")
    }

    async fn seeded() -> Arc<MemoryIdentityStore> {
        let store = Arc::new(MemoryIdentityStore::new());
        store
            .save(&FaceIdentity::new("alice".into(), "Alice", "alice@example.com", emb(0.0)))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_low_confidence_is_ignored() {
        let tracker = SelfImprovementTracker::new(ImprovementConfig::default(), seeded().await);
        let id = IdentityId::from("alice");
        assert_eq!(tracker.record_match(&id, 0.94, &emb(1.0)).await, ImprovementOutcome::Ignored);
        assert!(tracker.stats(&id).is_none());
    }

    #[tokio::test]
    async fn test_no_update_before_min_attempts() {
        let store = seeded().await;
        let tracker = SelfImprovementTracker::new(ImprovementConfig::default(), store.clone());
        let id = IdentityId::from("alice");

        for i in 0..4 {
            let out = tracker.record_match(&id, 1.0, &emb(i as f32 + 1.0)).await;
            assert!(matches!(out, ImprovementOutcome::Recorded(_)), "attempt {i}: {out:?}");
        }
        assert_eq!(store.find_by_id(&id).await.unwrap().unwrap().embedding, emb(0.0));

        assert_eq!(tracker.record_match(&id, 1.0, &emb(9.0)).await, ImprovementOutcome::TemplateRefreshed);
        assert_eq!(store.find_by_id(&id).await.unwrap().unwrap().embedding, emb(9.0));
        assert!(tracker.stats(&id).is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_is_retried() {
        let inner = MemoryIdentityStore::new();
        inner
            .save(&FaceIdentity::new("alice".into(), "Alice", "alice@example.com", emb(0.0)))
            .await
            .unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failing: AtomicBool::new(true),
        });
        let tracker = SelfImprovementTracker::new(ImprovementConfig::default(), store.clone());
        let id = IdentityId::from("alice");

        for _ in 0..4 {
            tracker.record_match(&id, 0.99, &emb(1.0)).await;
        }
        assert_eq!(tracker.record_match(&id, 0.99, &emb(2.0)).await, ImprovementOutcome::PersistFailed);
        assert_eq!(tracker.stats(&id).unwrap().attempts, 5);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(tracker.record_match(&id, 0.99, &emb(3.0)).await, ImprovementOutcome::TemplateRefreshed);
        assert_eq!(store.find_by_id(&id).await.unwrap().unwrap().embedding, emb(3.0));
    }
}
