//! Reconciliation between the local identity store and the remote face
//! collection.
//!
//! Every operation pages through the whole remote collection. Operations
//! are serialized against each other by one gate and never touch the
//! verification path; local rows are read and written one at a time.

use chrono::{DateTime, Utc};
use facegate_core::{FaceIdentity, IdentityId, IdentityStore, IdentitySummary, StoreError};
use facegate_remote::{FacePage, RemoteError, RemoteFace, RemoteRecognizer};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    Audit,
    Fix,
    Clean,
    FinalAudit,
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStep::Audit => "audit",
            SyncStep::Fix => "fix",
            SyncStep::Clean => "clean",
            SyncStep::FinalAudit => "final audit",
        })
    }
}

#[derive(Error, Debug)]
pub enum SyncFailure {
    #[error("no remote provider configured")]
    NoProvider,
    #[error("remote: {0}")]
    Remote(#[from] RemoteError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("remote listing repeated cursor {0}")]
    CursorLoop(String),
}

#[derive(Error, Debug)]
#[error("{step} failed after {pages_completed} page(s) and {changes_applied} change(s): {source}")]
pub struct SyncError {
    pub step: SyncStep,
    pub pages_completed: usize,
    pub changes_applied: usize,
    #[source]
    pub source: SyncFailure,
}

/// Point-in-time comparison of both sides.
#[derive(Debug, Clone, Serialize)]
pub struct SyncAuditReport {
    pub total_remote_faces: usize,
    pub total_local_identities: usize,
    pub synced: Vec<IdentitySummary>,
    pub missing_remote_id: Vec<IdentitySummary>,
    pub invalid_remote_id: Vec<IdentitySummary>,
    pub orphaned: Vec<RemoteFace>,
    pub pages_scanned: usize,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
}

impl SyncAuditReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_remote_id.is_empty() && self.invalid_remote_id.is_empty() && self.orphaned.is_empty()
    }

    /// Discrepancies Fix or Clean can act on.
    pub fn repairable(&self) -> usize {
        self.invalid_remote_id.len() + self.missing_remote_id.len() + self.orphaned.len()
    }
}

fn summarize(report: &SyncAuditReport) -> String {
    let mut s = format!(
        "remote faces: {}, local identities: {}, synced: {}, missing remote id: {}, invalid remote id: {}, orphaned: {}",
        report.total_remote_faces,
        report.total_local_identities,
        report.synced.len(),
        report.missing_remote_id.len(),
        report.invalid_remote_id.len(),
        report.orphaned.len(),
    );
    for face in report.orphaned.iter().take(20) {
        s.push_str(&format!(
            "\n  orphan {} (correlation {})",
            face.face_id,
            face.correlation_id.as_deref().unwrap_or("none")
        ));
    }
    if report.orphaned.len() > 20 {
        s.push_str(&format!("\n  ... {} more", report.orphaned.len() - 20));
    }
    s
}

impl fmt::Display for SyncAuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub step: SyncStep,
    pub pages_completed: usize,
    pub changes_applied: usize,
    pub message: String,
}

impl From<&SyncError> for StepFailure {
    fn from(e: &SyncError) -> Self {
        Self {
            step: e.step,
            pages_completed: e.pages_completed,
            changes_applied: e.changes_applied,
            message: e.source.to_string(),
        }
    }
}

/// Outcome of audit, fix, clean, re-audit. Steps after a failure are `None`.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub initial: Option<SyncAuditReport>,
    pub fixed: Option<usize>,
    pub cleaned: Option<usize>,
    #[serde(rename = "final")]
    pub final_report: Option<SyncAuditReport>,
    pub failure: Option<StepFailure>,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Pagination progress for error reporting.
#[derive(Default)]
struct Progress {
    pages: usize,
    changes: usize,
}

impl Progress {
    fn fail(&self, step: SyncStep, source: impl Into<SyncFailure>) -> SyncError {
        SyncError {
            step,
            pages_completed: self.pages,
            changes_applied: self.changes,
            source: source.into(),
        }
    }
}

pub struct SyncReconciler {
    store: Arc<dyn IdentityStore>,
    remote: Option<Arc<dyn RemoteRecognizer>>,
    gate: Mutex<()>,
}

impl SyncReconciler {
    pub fn new(store: Arc<dyn IdentityStore>, remote: Option<Arc<dyn RemoteRecognizer>>) -> Self {
        Self {
            store,
            remote,
            gate: Mutex::new(()),
        }
    }

    pub async fn audit(&self) -> Result<SyncAuditReport, SyncError> {
        let _gate = self.gate.lock().await;
        self.audit_inner(SyncStep::Audit).await
    }

    /// Re-point local remote-face ids at the faces whose correlation id
    /// names them. Returns the number of rows changed.
    pub async fn fix(&self) -> Result<usize, SyncError> {
        let _gate = self.gate.lock().await;
        self.fix_inner().await
    }

    /// Delete remote faces that no local identity claims.
    pub async fn clean(&self) -> Result<usize, SyncError> {
        let _gate = self.gate.lock().await;
        self.clean_inner().await
    }

    pub async fn recover(&self) -> RecoveryReport {
        let _gate = self.gate.lock().await;
        let mut report = RecoveryReport {
            initial: None,
            fixed: None,
            cleaned: None,
            final_report: None,
            failure: None,
        };

        let result = async {
            report.initial = Some(self.audit_inner(SyncStep::Audit).await?);
            report.fixed = Some(self.fix_inner().await?);
            report.cleaned = Some(self.clean_inner().await?);
            report.final_report = Some(self.audit_inner(SyncStep::FinalAudit).await?);
            Ok::<_, SyncError>(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "sync recovery stopped");
            report.failure = Some(StepFailure::from(&e));
        } else {
            tracing::info!(
                fixed = report.fixed.unwrap_or_default(),
                cleaned = report.cleaned.unwrap_or_default(),
                "sync recovery complete"
            );
        }
        report
    }

    fn remote(&self, step: SyncStep) -> Result<&dyn RemoteRecognizer, SyncError> {
        self.remote
            .as_deref()
            .ok_or_else(|| Progress::default().fail(step, SyncFailure::NoProvider))
    }

    /// Fetch the page after `cursor`, refusing a cursor seen before.
    async fn next_page(
        &self,
        remote: &dyn RemoteRecognizer,
        cursor: Option<&str>,
        seen: &mut HashSet<String>,
        progress: &Progress,
        step: SyncStep,
    ) -> Result<FacePage, SyncError> {
        if let Some(c) = cursor {
            if !seen.insert(c.to_string()) {
                return Err(progress.fail(step, SyncFailure::CursorLoop(c.to_string())));
            }
        }
        remote.list_faces(cursor).await.map_err(|e| progress.fail(step, e))
    }

    async fn list_all(&self, step: SyncStep) -> Result<(Vec<RemoteFace>, usize), SyncError> {
        let remote = self.remote(step)?;
        let mut faces = Vec::new();
        let mut progress = Progress::default();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.next_page(remote, cursor.as_deref(), &mut seen, &progress, step).await?;
            progress.pages += 1;
            faces.extend(page.faces);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok((faces, progress.pages))
    }

    async fn audit_inner(&self, step: SyncStep) -> Result<SyncAuditReport, SyncError> {
        let (faces, pages) = self.list_all(step).await?;
        let progress = Progress { pages, changes: 0 };
        let by_face_id: HashSet<&str> = faces.iter().map(|f| f.face_id.as_str()).collect();

        let identities = self.store.find_all().await.map_err(|e| progress.fail(step, e))?;
        let mut synced = Vec::new();
        let mut missing_remote_id = Vec::new();
        let mut invalid_remote_id = Vec::new();
        for identity in &identities {
            match identity.remote_face_id.as_deref() {
                None | Some("") => missing_remote_id.push(identity.summary()),
                Some(face_id) if !by_face_id.contains(face_id) => {
                    tracing::warn!(identity = %identity.id, face_id, "remote face id not found remotely");
                    invalid_remote_id.push(identity.summary());
                }
                Some(_) => synced.push(identity.summary()),
            }
        }

        let local = LocalIndex::new(&identities);
        let orphaned: Vec<RemoteFace> = faces.iter().filter(|f| !local.claims(f)).cloned().collect();

        let mut report = SyncAuditReport {
            total_remote_faces: faces.len(),
            total_local_identities: identities.len(),
            synced,
            missing_remote_id,
            invalid_remote_id,
            orphaned,
            pages_scanned: pages,
            generated_at: Utc::now(),
            summary: String::new(),
        };
        report.summary = summarize(&report);
        tracing::info!(
            remote = report.total_remote_faces,
            local = report.total_local_identities,
            synced = report.synced.len(),
            missing = report.missing_remote_id.len(),
            invalid = report.invalid_remote_id.len(),
            orphaned = report.orphaned.len(),
            pages,
            "sync audit"
        );
        Ok(report)
    }

    async fn fix_inner(&self) -> Result<usize, SyncError> {
        let step = SyncStep::Fix;
        let (faces, pages) = self.list_all(step).await?;
        let mut progress = Progress { pages, changes: 0 };

        // correlation id -> face ids, in listing order
        let mut by_correlation: Vec<(String, Vec<String>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for face in faces {
            let Some(correlation) = face.correlation_id.filter(|c| !c.is_empty()) else {
                tracing::warn!(face_id = %face.face_id, "remote face has no correlation id, skipping");
                continue;
            };
            match index.get(&correlation) {
                Some(&i) => by_correlation[i].1.push(face.face_id),
                None => {
                    index.insert(correlation.clone(), by_correlation.len());
                    by_correlation.push((correlation, vec![face.face_id]));
                }
            }
        }

        for (correlation, face_ids) in &by_correlation {
            let identity = self
                .resolve_correlation(correlation)
                .await
                .map_err(|e| progress.fail(step, e))?;
            let Some(identity) = identity else {
                tracing::warn!(correlation, "remote face names no local identity");
                continue;
            };
            if identity
                .remote_face_id
                .as_ref()
                .is_some_and(|current| face_ids.contains(current))
            {
                continue;
            }

            let target = &face_ids[0];
            if let Some(holder) = self
                .store
                .find_by_remote_face_id(target)
                .await
                .map_err(|e| progress.fail(step, e))?
            {
                if holder.id != identity.id {
                    tracing::info!(identity = %holder.id, face_id = %target, "clearing stale remote face id");
                    self.store
                        .update_remote_face_id(&holder.id, None)
                        .await
                        .map_err(|e| progress.fail(step, e))?;
                    progress.changes += 1;
                }
            }

            tracing::info!(
                identity = %identity.id,
                from = identity.remote_face_id.as_deref().unwrap_or("none"),
                to = %target,
                "fixing remote face id"
            );
            self.store
                .update_remote_face_id(&identity.id, Some(target))
                .await
                .map_err(|e| progress.fail(step, e))?;
            progress.changes += 1;
        }

        tracing::info!(updated = progress.changes, "sync fix complete");
        Ok(progress.changes)
    }

    async fn clean_inner(&self) -> Result<usize, SyncError> {
        let step = SyncStep::Clean;
        let remote = self.remote(step)?;
        let mut progress = Progress::default();
        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.next_page(remote, cursor.as_deref(), &mut seen, &progress, step).await?;

            let mut orphans = Vec::new();
            for face in &page.faces {
                if !self.is_claimed(face).await.map_err(|e| progress.fail(step, e))? {
                    tracing::warn!(
                        face_id = %face.face_id,
                        correlation = face.correlation_id.as_deref().unwrap_or("none"),
                        "orphaned remote face"
                    );
                    orphans.push(face.face_id.clone());
                }
            }
            if !orphans.is_empty() {
                match remote.delete_faces(&orphans).await {
                    Ok(deleted) => {
                        tracing::info!(count = deleted.len(), "deleted orphaned remote faces");
                        progress.changes += deleted.len();
                    }
                    Err(e) => {
                        progress.changes += e.deleted().len();
                        return Err(progress.fail(step, e));
                    }
                }
            }
            progress.pages += 1;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(deleted = progress.changes, pages = progress.pages, "orphan cleanup complete");
        Ok(progress.changes)
    }

    /// Local identity named by a correlation id: the correlation column
    /// first, then the primary id.
    async fn resolve_correlation(&self, correlation: &str) -> Result<Option<FaceIdentity>, StoreError> {
        if let Some(identity) = self.store.find_by_correlation_id(correlation).await? {
            return Ok(Some(identity));
        }
        self.store.find_by_id(&IdentityId::from(correlation)).await
    }

    async fn is_claimed(&self, face: &RemoteFace) -> Result<bool, StoreError> {
        if self.store.find_by_remote_face_id(&face.face_id).await?.is_some() {
            return Ok(true);
        }
        match face.correlation_id.as_deref().filter(|c| !c.is_empty()) {
            Some(c) => Ok(self.resolve_correlation(c).await?.is_some()),
            None => Ok(false),
        }
    }
}

/// Snapshot lookups used by the audit.
struct LocalIndex<'a> {
    face_ids: HashSet<&'a str>,
    correlations: HashSet<&'a str>,
    ids: HashSet<&'a str>,
}

impl<'a> LocalIndex<'a> {
    fn new(identities: &'a [FaceIdentity]) -> Self {
        Self {
            face_ids: identities.iter().filter_map(|i| i.remote_face_id.as_deref()).collect(),
            correlations: identities.iter().filter_map(|i| i.correlation_id.as_deref()).collect(),
            ids: identities.iter().map(|i| i.id.as_str()).collect(),
        }
    }

    fn claims(&self, face: &RemoteFace) -> bool {
        if self.face_ids.contains(face.face_id.as_str()) {
            return true;
        }
        match face.correlation_id.as_deref().filter(|c| !c.is_empty()) {
            Some(c) => self.correlations.contains(c) || self.ids.contains(c),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use facegate_core::{Embedding, MemoryIdentityStore};
    use facegate_remote::{MemoryRecognizer, RemoteDetection, RemoteMatch};

    fn identity(id: &str, remote: Option<&str>, correlation: Option<&str>) -> FaceIdentity {
        let mut identity = FaceIdentity::new(
            IdentityId::from(id),
            id,
            format!("{id}@example.com"),
            Embedding::new(vec![1.0, 0.0], "test"),
        );
        identity.remote_face_id = remote.map(str::to_string);
        identity.correlation_id = correlation.map(str::to_string);
        identity
    }

    async fn fixture(
        rows: Vec<FaceIdentity>,
        faces: &[(&str, Option<&str>)],
    ) -> (SyncReconciler, Arc<MemoryIdentityStore>, Arc<MemoryRecognizer>) {
        let store = Arc::new(MemoryIdentityStore::new());
        for row in &rows {
            store.save(row).await.unwrap();
        }
        let remote = Arc::new(MemoryRecognizer::new(2));
        for (id, correlation) in faces {
            remote.insert_face(*id, *correlation);
        }
        let reconciler = SyncReconciler::new(store.clone(), Some(remote.clone() as Arc<dyn RemoteRecognizer>));
        (reconciler, store, remote)
    }

    #[tokio::test]
    async fn test_audit_classifies_both_sides() {
        let (reconciler, _, _) = fixture(
            vec![
                identity("alice", Some("f1"), Some("alice")),
                identity("bob", None, Some("bob")),
                identity("carol", Some("gone"), Some("carol")),
                identity("dave", None, None),
            ],
            &[("f1", Some("alice")), ("f2", Some("bob")), ("f3", Some("dave")), ("f4", Some("nobody")), ("f5", None)],
        )
        .await;

        let report = reconciler.audit().await.unwrap();
        assert_eq!(report.total_remote_faces, 5);
        assert_eq!(report.total_local_identities, 4);
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.missing_remote_id.len(), 2);
        assert_eq!(report.invalid_remote_id[0].id.as_str(), "carol");
        let orphans: Vec<&str> = report.orphaned.iter().map(|f| f.face_id.as_str()).collect();
        assert_eq!(orphans, vec!["f4", "f5"]);
        assert_eq!(report.pages_scanned, 3);
        assert!(!report.is_consistent());
        assert!(report.to_string().contains("orphaned: 2"));
    }

    #[tokio::test]
    async fn test_audit_traverses_every_page() {
        let store = Arc::new(MemoryIdentityStore::new());
        let remote = Arc::new(MemoryRecognizer::new(1000));
        for i in 0..3001 {
            remote.insert_face(format!("f{i:05}"), None);
        }
        let reconciler = SyncReconciler::new(store, Some(remote as Arc<dyn RemoteRecognizer>));
        let report = reconciler.audit().await.unwrap();
        assert_eq!(report.total_remote_faces, 3001);
        assert_eq!(report.pages_scanned, 4);
        assert!(report.orphaned.iter().any(|f| f.face_id == "f03000"));
    }

    #[tokio::test]
    async fn test_fix_is_idempotent() {
        let (reconciler, store, _) = fixture(
            vec![
                identity("alice", Some("stale"), Some("alice")),
                identity("bob", None, None),
                identity("carol", Some("f3"), Some("carol")),
            ],
            &[("f1", Some("alice")), ("f2", Some("bob")), ("f3", Some("carol")), ("f4", None)],
        )
        .await;

        assert_eq!(reconciler.fix().await.unwrap(), 2);
        let alice = store.find_by_id(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(alice.remote_face_id.as_deref(), Some("f1"));
        // bob has no correlation column; resolved through the primary id
        let bob = store.find_by_id(&"bob".into()).await.unwrap().unwrap();
        assert_eq!(bob.remote_face_id.as_deref(), Some("f2"));

        assert_eq!(reconciler.fix().await.unwrap(), 0);
        assert!(reconciler.audit().await.unwrap().invalid_remote_id.is_empty());
    }

    #[tokio::test]
    async fn test_fix_moves_face_id_from_stale_holder() {
        let (reconciler, store, _) = fixture(
            vec![
                identity("alice", None, Some("alice")),
                identity("bob", Some("f1"), Some("bob")),
            ],
            &[("f1", Some("alice"))],
        )
        .await;

        assert_eq!(reconciler.fix().await.unwrap(), 2);
        assert_eq!(
            store.find_by_id(&"alice".into()).await.unwrap().unwrap().remote_face_id.as_deref(),
            Some("f1")
        );
        assert!(store.find_by_id(&"bob".into()).await.unwrap().unwrap().remote_face_id.is_none());
        assert_eq!(reconciler.fix().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_deletes_only_orphans_and_is_idempotent() {
        let (reconciler, _, remote) = fixture(
            vec![identity("alice", Some("f1"), Some("alice")), identity("bob", None, None)],
            &[("f1", None), ("f2", Some("bob")), ("f3", Some("ghost")), ("f4", None), ("f5", Some("ghost2"))],
        )
        .await;

        assert_eq!(reconciler.clean().await.unwrap(), 3);
        assert!(remote.contains("f1"));
        assert!(remote.contains("f2"));
        assert_eq!(remote.face_count(), 2);
        assert_eq!(reconciler.clean().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_reports_before_and_after() {
        let (reconciler, _, _) = fixture(
            vec![identity("alice", Some("stale"), Some("alice"))],
            &[("f1", Some("alice")), ("f2", Some("nobody"))],
        )
        .await;

        let report = reconciler.recover().await;
        assert!(report.is_complete());
        assert!(!report.initial.as_ref().unwrap().is_consistent());
        assert_eq!(report.fixed, Some(1));
        assert_eq!(report.cleaned, Some(1));
        assert!(report.final_report.as_ref().unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_with_progress() {
        let (reconciler, _, remote) = fixture(vec![], &[("f1", None), ("f2", None), ("f3", None)]).await;
        remote.fail_next(1);
        let err = reconciler.audit().await.unwrap_err();
        assert_eq!(err.step, SyncStep::Audit);
        assert_eq!(err.pages_completed, 0);
        assert!(matches!(err.source, SyncFailure::Remote(_)));

        remote.fail_next(1);
        let report = reconciler.recover().await;
        assert!(!report.is_complete());
        assert!(report.initial.is_none());
        assert!(report.fixed.is_none());
        assert_eq!(report.failure.unwrap().step, SyncStep::Audit);
    }

    #[tokio::test]
    async fn test_without_provider() {
        let reconciler = SyncReconciler::new(Arc::new(MemoryIdentityStore::new()), None);
        assert!(matches!(
            reconciler.audit().await.unwrap_err().source,
            SyncFailure::NoProvider
        ));
    }

    /// Recognizer whose listing never advances.
    struct LoopingRecognizer;

    #[async_trait]
    impl RemoteRecognizer for LoopingRecognizer {
        fn name(&self) -> &str {
            "looping"
        }
        async fn detect(&self, _: &[u8]) -> Result<Vec<RemoteDetection>, RemoteError> {
            Ok(vec![])
        }
        async fn index(&self, _: &[u8], _: &str) -> Result<String, RemoteError> {
            Ok("x".into())
        }
        async fn search(&self, _: &[u8]) -> Result<Option<RemoteMatch>, RemoteError> {
            Ok(None)
        }
        async fn list_faces(&self, _: Option<&str>) -> Result<FacePage, RemoteError> {
            Ok(FacePage {
                faces: vec![],
                next_cursor: Some("same".into()),
            })
        }
        async fn delete_faces(&self, _: &[String]) -> Result<Vec<String>, RemoteError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_an_error() {
        let reconciler = SyncReconciler::new(
            Arc::new(MemoryIdentityStore::new()),
            Some(Arc::new(LoopingRecognizer) as Arc<dyn RemoteRecognizer>),
        );
        let err = reconciler.clean().await.unwrap_err();
        assert!(matches!(err.source, SyncFailure::CursorLoop(_)));
        assert_eq!(err.pages_completed, 2);
    }

    /// Delegates to a memory collection but fails every deletion after the
    /// first face.
    struct FailingDelete(Arc<MemoryRecognizer>);

    #[async_trait]
    impl RemoteRecognizer for FailingDelete {
        fn name(&self) -> &str {
            "failing-delete"
        }
        async fn detect(&self, image: &[u8]) -> Result<Vec<RemoteDetection>, RemoteError> {
            self.0.detect(image).await
        }
        async fn index(&self, image: &[u8], correlation_id: &str) -> Result<String, RemoteError> {
            self.0.index(image, correlation_id).await
        }
        async fn search(&self, image: &[u8]) -> Result<Option<RemoteMatch>, RemoteError> {
            self.0.search(image).await
        }
        async fn list_faces(&self, cursor: Option<&str>) -> Result<FacePage, RemoteError> {
            self.0.list_faces(cursor).await
        }
        async fn delete_faces(&self, face_ids: &[String]) -> Result<Vec<String>, RemoteError> {
            let deleted = self.0.delete_faces(&face_ids[..1]).await?;
            Err(RemoteError::PartialDelete {
                deleted,
                source: Box::new(RemoteError::Transport("connection reset".into())),
            })
        }
    }

    #[tokio::test]
    async fn test_recover_stops_when_clean_fails_after_fix() {
        let store = Arc::new(MemoryIdentityStore::new());
        store
            .save(&identity("alice", Some("stale"), Some("alice")))
            .await
            .unwrap();
        let memory = Arc::new(MemoryRecognizer::new(10));
        memory.insert_face("f1", Some("alice"));
        memory.insert_face("f2", Some("nobody"));
        memory.insert_face("f3", Some("ghost"));
        let reconciler = SyncReconciler::new(
            store.clone(),
            Some(Arc::new(FailingDelete(memory.clone())) as Arc<dyn RemoteRecognizer>),
        );

        let report = reconciler.recover().await;
        assert!(!report.is_complete());
        assert!(report.initial.is_some());
        assert_eq!(report.fixed, Some(1));
        assert!(report.cleaned.is_none());
        assert!(report.final_report.is_none());

        let failure = report.failure.unwrap();
        assert_eq!(failure.step, SyncStep::Clean);
        assert_eq!(failure.changes_applied, 1);
        assert_eq!(failure.pages_completed, 0);

        // the fix step's work is kept
        let alice = store.find_by_id(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(alice.remote_face_id.as_deref(), Some("f1"));
        assert!(memory.contains("f1"));
        assert!(!memory.contains("f2"));
        assert!(memory.contains("f3"));
        assert_eq!(memory.calls().delete, 1);
    }
}
