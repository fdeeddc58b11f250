//! In-process face collection implementing [`RemoteRecognizer`].
//!
//! Faces are kept in id order and listed with an id cursor, so deleting
//! faces between pages never skips any. Detections and search results can
//! be scripted; failures and latency can be injected.

use crate::provider::{FacePage, RemoteDetection, RemoteError, RemoteFace, RemoteMatch, RemoteRecognizer};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub detect: usize,
    pub index: usize,
    pub search: usize,
    pub list: usize,
    pub delete: usize,
}

impl CallCounts {
    pub fn total(&self) -> usize {
        self.detect + self.index + self.search + self.list + self.delete
    }
}

#[derive(Debug, Clone)]
struct StoredFace {
    correlation_id: Option<String>,
    digest: Option<u64>,
}

#[derive(Default)]
struct State {
    faces: BTreeMap<String, StoredFace>,
    detections: Vec<RemoteDetection>,
    search_result: Option<RemoteMatch>,
    failures_remaining: usize,
    latency: Option<Duration>,
    calls: CallCounts,
    next_id: u64,
}

pub struct MemoryRecognizer {
    page_size: usize,
    state: Mutex<State>,
}

fn digest(image: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    image.hash(&mut h);
    h.finish()
}

impl MemoryRecognizer {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a face directly, bypassing `index`.
    pub fn insert_face(&self, face_id: impl Into<String>, correlation_id: Option<&str>) {
        self.state().faces.insert(
            face_id.into(),
            StoredFace {
                correlation_id: correlation_id.map(str::to_string),
                digest: None,
            },
        );
    }

    pub fn contains(&self, face_id: &str) -> bool {
        self.state().faces.contains_key(face_id)
    }

    pub fn face_count(&self) -> usize {
        self.state().faces.len()
    }

    pub fn set_detections(&self, detections: Vec<RemoteDetection>) {
        self.state().detections = detections;
    }

    pub fn set_search_result(&self, result: Option<RemoteMatch>) {
        self.state().search_result = result;
    }

    /// Make the next `n` calls fail with a transport error.
    pub fn fail_next(&self, n: usize) {
        self.state().failures_remaining = n;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    /// Count the call, apply latency, consume an injected failure.
    async fn enter(&self, count: impl FnOnce(&mut CallCounts)) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.state();
            count(&mut state.calls);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(RemoteError::Transport("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteRecognizer for MemoryRecognizer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn detect(&self, _image: &[u8]) -> Result<Vec<RemoteDetection>, RemoteError> {
        self.enter(|c| c.detect += 1).await?;
        Ok(self.state().detections.clone())
    }

    async fn index(&self, image: &[u8], correlation_id: &str) -> Result<String, RemoteError> {
        self.enter(|c| c.index += 1).await?;
        let mut state = self.state();
        state.next_id += 1;
        let face_id = format!("mem-{:08}", state.next_id);
        state.faces.insert(
            face_id.clone(),
            StoredFace {
                correlation_id: Some(correlation_id.to_string()),
                digest: Some(digest(image)),
            },
        );
        Ok(face_id)
    }

    async fn search(&self, image: &[u8]) -> Result<Option<RemoteMatch>, RemoteError> {
        self.enter(|c| c.search += 1).await?;
        let state = self.state();
        if let Some(scripted) = &state.search_result {
            return Ok(Some(scripted.clone()));
        }
        let d = digest(image);
        Ok(state
            .faces
            .iter()
            .find(|(_, f)| f.digest == Some(d))
            .map(|(id, f)| RemoteMatch {
                face: RemoteFace {
                    face_id: id.clone(),
                    correlation_id: f.correlation_id.clone(),
                },
                similarity: 1.0,
            }))
    }

    async fn list_faces(&self, cursor: Option<&str>) -> Result<FacePage, RemoteError> {
        self.enter(|c| c.list += 1).await?;
        let state = self.state();
        let lower = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Unbounded,
        };
        let faces: Vec<RemoteFace> = state
            .faces
            .range((lower, Bound::Unbounded))
            .take(self.page_size)
            .map(|(id, f)| RemoteFace {
                face_id: id.clone(),
                correlation_id: f.correlation_id.clone(),
            })
            .collect();

        let next_cursor = faces.last().map(|f| f.face_id.clone()).filter(|last| {
            state
                .faces
                .range::<String, _>((Bound::Excluded(last.clone()), Bound::Unbounded))
                .next()
                .is_some()
        });
        Ok(FacePage { faces, next_cursor })
    }

    async fn delete_faces(&self, face_ids: &[String]) -> Result<Vec<String>, RemoteError> {
        self.enter(|c| c.delete += 1).await?;
        let mut state = self.state();
        Ok(face_ids
            .iter()
            .filter(|id| state.faces.remove(id.as_str()).is_some())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pagination_covers_everything() {
        let remote = MemoryRecognizer::new(1000);
        for i in 0..3001 {
            remote.insert_face(format!("f{i:05}"), Some(&format!("u{i}")));
        }

        let mut cursor: Option<String> = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = remote.list_faces(cursor.as_deref()).await.unwrap();
            seen += page.faces.len();
            pages += 1;
            match page.next_cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, 3001);
        assert_eq!(pages, 4);
    }

    #[tokio::test]
    async fn test_exact_page_multiple_has_no_trailing_page() {
        let remote = MemoryRecognizer::new(2);
        for id in ["a", "b", "c", "d"] {
            remote.insert_face(id, None);
        }
        let first = remote.list_faces(None).await.unwrap();
        let second = remote.list_faces(first.next_cursor.as_deref()).await.unwrap();
        assert_eq!(second.faces.len(), 2);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_index_search_and_delete() {
        let remote = MemoryRecognizer::new(10);
        let id = remote.index(b"face-bytes", "user-1").await.unwrap();
        let hit = remote.search(b"face-bytes").await.unwrap().unwrap();
        assert_eq!(hit.face.face_id, id);
        assert_eq!(hit.face.correlation_id.as_deref(), Some("user-1"));
        assert!(remote.search(b"other").await.unwrap().is_none());

        let deleted = remote.delete_faces(&[id.clone(), "missing".into()]).await.unwrap();
        assert_eq!(deleted, vec![id]);
        assert_eq!(remote.face_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let remote = MemoryRecognizer::new(10);
        remote.fail_next(2);
        assert!(remote.detect(b"x").await.is_err());
        assert!(remote.detect(b"x").await.is_err());
        assert!(remote.detect(b"x").await.unwrap().is_empty());
        assert_eq!(remote.calls().detect, 3);
    }
}
