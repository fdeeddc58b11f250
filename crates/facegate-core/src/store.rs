//! Identity repository contract and an in-memory implementation.

use crate::types::{Embedding, FaceIdentity, IdentityId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("{field} already in use: {value}")]
    Conflict { field: &'static str, value: String },
    #[error("store backend: {0}")]
    Backend(String),
}

/// Strongly consistent, row-atomic identity storage.
///
/// `save` inserts or replaces by id and must reject duplicates of
/// `email`, `remote_face_id` and `correlation_id` held by another row.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_id(&self, id: &IdentityId) -> Result<Option<FaceIdentity>, StoreError>;
    async fn find_all(&self) -> Result<Vec<FaceIdentity>, StoreError>;
    async fn find_by_email(&self, email: &str) -> Result<Option<FaceIdentity>, StoreError>;
    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<FaceIdentity>, StoreError>;
    async fn find_by_remote_face_id(&self, face_id: &str) -> Result<Option<FaceIdentity>, StoreError>;
    async fn save(&self, identity: &FaceIdentity) -> Result<(), StoreError>;
    /// Returns whether a row was removed.
    async fn delete(&self, id: &IdentityId) -> Result<bool, StoreError>;
    async fn update_embedding(&self, id: &IdentityId, embedding: &Embedding) -> Result<(), StoreError>;
    async fn update_remote_face_id(&self, id: &IdentityId, face_id: Option<&str>) -> Result<(), StoreError>;

    async fn exists_by_email(&self, email: &str) -> Result<bool, StoreError> {
        Ok(self.find_by_email(email).await?.is_some())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.find_all().await?.len())
    }
}

/// Process-local store, used by tests and diskless deployments.
#[derive(Default)]
pub struct MemoryIdentityStore {
    rows: RwLock<HashMap<IdentityId, FaceIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&HashMap<IdentityId, FaceIdentity>) -> T) -> T {
        f(&self.rows.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut HashMap<IdentityId, FaceIdentity>) -> T) -> T {
        f(&mut self.rows.write().unwrap_or_else(PoisonError::into_inner))
    }

    fn find_where(&self, pred: impl Fn(&FaceIdentity) -> bool) -> Option<FaceIdentity> {
        self.read(|rows| rows.values().find(|r| pred(r)).cloned())
    }
}

fn check_unique(rows: &HashMap<IdentityId, FaceIdentity>, candidate: &FaceIdentity) -> Result<(), StoreError> {
    for other in rows.values().filter(|r| r.id != candidate.id) {
        if other.email.eq_ignore_ascii_case(&candidate.email) {
            return Err(StoreError::Conflict {
                field: "email",
                value: candidate.email.clone(),
            });
        }
        if let (Some(a), Some(b)) = (&other.remote_face_id, &candidate.remote_face_id) {
            if a == b {
                return Err(StoreError::Conflict {
                    field: "remote_face_id",
                    value: b.clone(),
                });
            }
        }
        if let (Some(a), Some(b)) = (&other.correlation_id, &candidate.correlation_id) {
            if a == b {
                return Err(StoreError::Conflict {
                    field: "correlation_id",
                    value: b.clone(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_id(&self, id: &IdentityId) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self.read(|rows| rows.get(id).cloned()))
    }

    async fn find_all(&self) -> Result<Vec<FaceIdentity>, StoreError> {
        let mut all = self.read(|rows| rows.values().cloned().collect::<Vec<_>>());
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self.find_where(|r| r.email.eq_ignore_ascii_case(email)))
    }

    async fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self.find_where(|r| r.correlation_id.as_deref() == Some(correlation_id)))
    }

    async fn find_by_remote_face_id(&self, face_id: &str) -> Result<Option<FaceIdentity>, StoreError> {
        Ok(self.find_where(|r| r.remote_face_id.as_deref() == Some(face_id)))
    }

    async fn save(&self, identity: &FaceIdentity) -> Result<(), StoreError> {
        self.write(|rows| {
            check_unique(rows, identity)?;
            rows.insert(identity.id.clone(), identity.clone());
            Ok(())
        })
    }

    async fn delete(&self, id: &IdentityId) -> Result<bool, StoreError> {
        Ok(self.write(|rows| rows.remove(id).is_some()))
    }

    async fn update_embedding(&self, id: &IdentityId, embedding: &Embedding) -> Result<(), StoreError> {
        self.write(|rows| {
            let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            row.embedding = embedding.clone();
            row.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_remote_face_id(&self, id: &IdentityId, face_id: Option<&str>) -> Result<(), StoreError> {
        self.write(|rows| {
            if let Some(fid) = face_id {
                if rows.values().any(|r| &r.id != id && r.remote_face_id.as_deref() == Some(fid)) {
                    return Err(StoreError::Conflict {
                        field: "remote_face_id",
                        value: fid.to_string(),
                    });
                }
            }
            let row = rows.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
            row.remote_face_id = face_id.map(str::to_string);
            row.updated_at = Utc::now();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str) -> FaceIdentity {
        FaceIdentity::new(
            IdentityId::from(id),
            id,
            format!("{id}@example.com"),
            Embedding::new(vec![1.0, 0.0], "test"),
        )
    }

    #[tokio::test]
    async fn test_save_and_lookups() {
        let store = MemoryIdentityStore::new();
        let mut alice = identity("alice");
        alice.remote_face_id = Some("face-1".into());
        alice.correlation_id = Some("alice".into());
        store.save(&alice).await.unwrap();

        assert_eq!(store.find_by_id(&"alice".into()).await.unwrap().unwrap().name, "alice");
        assert!(store.exists_by_email("ALICE@example.com").await.unwrap());
        assert!(store.find_by_remote_face_id("face-1").await.unwrap().is_some());
        assert!(store.find_by_correlation_id("alice").await.unwrap().is_some());
        assert!(store.find_by_correlation_id("bob").await.unwrap().is_none());
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_uniqueness_is_enforced() {
        let store = MemoryIdentityStore::new();
        let mut alice = identity("alice");
        alice.remote_face_id = Some("face-1".into());
        store.save(&alice).await.unwrap();

        let mut clash = identity("bob");
        clash.email = "alice@example.com".into();
        assert!(matches!(store.save(&clash).await, Err(StoreError::Conflict { field: "email", .. })));

        let mut bob = identity("bob");
        bob.remote_face_id = Some("face-1".into());
        assert!(matches!(
            store.save(&bob).await,
            Err(StoreError::Conflict { field: "remote_face_id", .. })
        ));

        store.save(&identity("bob")).await.unwrap();
        assert!(store.update_remote_face_id(&"bob".into(), Some("face-1")).await.is_err());
        store.update_remote_face_id(&"bob".into(), Some("face-2")).await.unwrap();

        // re-saving the same row is not a conflict with itself
        store.save(&alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_and_delete() {
        let store = MemoryIdentityStore::new();
        store.save(&identity("alice")).await.unwrap();

        let fresh = Embedding::new(vec![0.0, 1.0], "test");
        store.update_embedding(&"alice".into(), &fresh).await.unwrap();
        assert_eq!(store.find_by_id(&"alice".into()).await.unwrap().unwrap().embedding, fresh);

        assert!(matches!(
            store.update_embedding(&"ghost".into(), &fresh).await,
            Err(StoreError::NotFound(_))
        ));

        assert!(store.delete(&"alice".into()).await.unwrap());
        assert!(!store.delete(&"alice".into()).await.unwrap());
    }
}
