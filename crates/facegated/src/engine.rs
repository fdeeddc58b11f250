use crate::consensus::{ConsensusConfig, ConsensusOutcome, FrameVerifier, MultiFrameConsensus};
use crate::object_store::ObjectStore;
use crate::sync::{RecoveryReport, SyncAuditReport, SyncError, SyncReconciler};
use crate::verification_log::{VerificationLog, VerificationRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use facegate_core::improvement::{ImprovementOutcome, SelfImprovementTracker};
use facegate_core::pipeline::{FrameAnalysis, LocalPipeline};
use facegate_core::threshold::ThresholdConfig;
use facegate_core::{
    DecisionSource, Embedding, FaceIdentity, Frame, IdentityId, IdentityStore, IdentitySummary, MatchedIdentity,
    StoreError, VerificationOutcome,
};
use facegate_remote::{ExternalServiceGuard, GuardOutcome, GuardStatus, ProviderError, RemoteFace, RemoteRecognizer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid image: {0}")]
    Input(String),
    #[error("registration rejected: {0}")]
    Registration(String),
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("verification timed out after {0:?}")]
    Timeout(Duration),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub verify_timeout_secs: u64,
    /// Stream frames collected before a consensus run.
    pub stream_buffer_size: usize,
    /// A stream with no frame for this long loses its buffered frames.
    pub stream_idle_ms: u64,
    /// Minimum provider similarity for a remote decision.
    pub remote_similarity_threshold: f32,
    /// Local similarity at which a new registration counts as a duplicate.
    pub duplicate_threshold: f32,
    pub min_registration_brightness: f32,
    pub min_registration_liveness: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_timeout_secs: 10,
            stream_buffer_size: 3,
            stream_idle_ms: 30_000,
            remote_similarity_threshold: 0.8,
            duplicate_threshold: 0.8,
            min_registration_brightness: 40.0,
            min_registration_liveness: 40.0,
        }
    }
}

/// Result of a verify call: one frame, or a vote over several.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Single(VerificationOutcome),
    Consensus(ConsensusOutcome),
}

impl Verdict {
    pub fn authorized(&self) -> bool {
        match self {
            Verdict::Single(o) => o.authorized,
            Verdict::Consensus(o) => o.authorized,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrationRequest {
    pub name: String,
    pub email: String,
    pub department: Option<String>,
    pub position: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub detector_available: bool,
    pub extractor: String,
    pub embedding_dimension: usize,
    pub identities: usize,
    pub open_streams: usize,
    pub thresholds: ThresholdConfig,
    pub remote: GuardStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub identities: usize,
    pub empty_embeddings: Vec<IdentityId>,
    /// Templates produced by a different extractor than the running one.
    pub foreign_templates: usize,
    pub audit: Option<SyncAuditReport>,
}

/// Everything the engine is assembled from.
pub struct EngineParts {
    pub config: EngineConfig,
    pub consensus: ConsensusConfig,
    pub pipeline: Arc<LocalPipeline>,
    pub detector_available: bool,
    pub store: Arc<dyn IdentityStore>,
    pub logs: Arc<dyn VerificationLog>,
    pub objects: Arc<dyn ObjectStore>,
    pub remote: Option<Arc<dyn RemoteRecognizer>>,
    pub guard: Arc<ExternalServiceGuard>,
    pub improvement: Arc<SelfImprovementTracker>,
}

struct StreamBuffer {
    frames: Vec<Vec<u8>>,
    last_seen: Instant,
}

pub struct Engine {
    config: EngineConfig,
    pipeline: Arc<LocalPipeline>,
    detector_available: bool,
    store: Arc<dyn IdentityStore>,
    logs: Arc<dyn VerificationLog>,
    objects: Arc<dyn ObjectStore>,
    guard: Arc<ExternalServiceGuard>,
    improvement: Arc<SelfImprovementTracker>,
    consensus: MultiFrameConsensus,
    reconciler: SyncReconciler,
    streams: DashMap<String, StreamBuffer>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Arc<Self> {
        let reconciler = SyncReconciler::new(parts.store.clone(), parts.remote.clone());
        Arc::new(Self {
            config: parts.config,
            pipeline: parts.pipeline,
            detector_available: parts.detector_available,
            store: parts.store,
            logs: parts.logs,
            objects: parts.objects,
            guard: parts.guard,
            improvement: parts.improvement,
            consensus: MultiFrameConsensus::new(parts.consensus),
            reconciler,
            streams: DashMap::new(),
        })
    }

    /// Verify one frame, or a live batch by consensus.
    ///
    /// Non-live requests only look at the first frame.
    pub async fn verify(self: &Arc<Self>, mut frames: Vec<Vec<u8>>, live: bool) -> Result<Verdict, EngineError> {
        if frames.is_empty() {
            return Err(EngineError::Input("no frames provided".into()));
        }
        let limit = Duration::from_secs(self.config.verify_timeout_secs);
        let work = async move {
            if live && frames.len() > 1 {
                let verifier: Arc<dyn FrameVerifier> = self.clone();
                Ok(Verdict::Consensus(self.consensus.verify(frames, verifier).await))
            } else {
                if frames.len() > 1 {
                    tracing::debug!(frames = frames.len(), "non-live request, using first frame");
                }
                let first = frames.swap_remove(0);
                self.verify_single(first).await.map(Verdict::Single)
            }
        };
        tokio::time::timeout(limit, work)
            .await
            .map_err(|_| EngineError::Timeout(limit))?
    }

    /// Buffer `frame` for `stream_id`; once the buffer is full, verify the
    /// buffered frames by consensus, otherwise verify this frame alone.
    ///
    /// Streams idle for longer than `stream_idle_ms` are dropped first.
    pub async fn verify_stream(self: &Arc<Self>, stream_id: &str, frame: Vec<u8>) -> Result<Verdict, EngineError> {
        let now = Instant::now();
        self.evict_idle_streams(now);

        let size = self.config.stream_buffer_size.max(1);
        let batch = {
            let mut buffer = self.streams.entry(stream_id.to_string()).or_insert_with(|| StreamBuffer {
                frames: Vec::new(),
                last_seen: now,
            });
            buffer.last_seen = now;
            buffer.frames.push(frame.clone());
            if buffer.frames.len() >= size {
                Some(std::mem::take(&mut buffer.frames))
            } else {
                None
            }
        };

        match batch {
            Some(frames) => {
                self.streams.remove_if(stream_id, |_, b| b.frames.is_empty());
                tracing::debug!(stream = stream_id, frames = frames.len(), "stream buffer full");
                self.verify(frames, true).await
            }
            None => self.verify(vec![frame], false).await,
        }
    }

    fn evict_idle_streams(&self, now: Instant) {
        let idle = Duration::from_millis(self.config.stream_idle_ms);
        let before = self.streams.len();
        self.streams.retain(|_, b| now.saturating_duration_since(b.last_seen) < idle);
        let evicted = before.saturating_sub(self.streams.len());
        if evicted > 0 {
            tracing::debug!(evicted, "idle stream buffers dropped");
        }
    }

    /// Verify a single encoded frame: local pipeline and remote opinion in
    /// parallel, then fuse.
    pub async fn verify_single(&self, image: Vec<u8>) -> Result<VerificationOutcome, EngineError> {
        if image.is_empty() {
            return Err(EngineError::Input("empty image".into()));
        }
        if let Err(e) = image::guess_format(&image) {
            return Err(EngineError::Input(e.to_string()));
        }

        let gallery = self.gallery().await?;
        let (local, remote) = tokio::join!(self.analyze_local(image.clone(), gallery), self.guard.verify(image));
        let local = local?;
        let outcome = self.fuse(&local, remote).await;

        if outcome.authorized && outcome.source == DecisionSource::Local {
            if let (Some(identity), Some(query)) = (&outcome.identity, &local.query) {
                self.report_match(&identity.id, outcome.similarity, query).await;
            }
        }
        self.log_verification(&outcome).await;

        tracing::info!(
            authorized = outcome.authorized,
            identity = outcome.identity.as_ref().map(|i| i.id.as_str()).unwrap_or("none"),
            similarity = outcome.similarity,
            source = ?outcome.source,
            "frame verified"
        );
        Ok(outcome)
    }

    /// Identities whose template the running extractor can be compared with.
    async fn gallery(&self) -> Result<Vec<FaceIdentity>, EngineError> {
        let dimension = self.pipeline.extractor().dimension();
        let mut identities = self.store.find_all().await?;
        let before = identities.len();
        identities.retain(|i| i.embedding.dim() == dimension);
        if identities.len() < before {
            tracing::debug!(skipped = before - identities.len(), dimension, "templates with foreign dimension skipped");
        }
        Ok(identities)
    }

    async fn analyze_local(&self, image: Vec<u8>, gallery: Vec<FaceIdentity>) -> Result<FrameAnalysis, EngineError> {
        let pipeline = self.pipeline.clone();
        tokio::task::spawn_blocking(move || {
            let frame = Frame::decode(&image).map_err(|e| EngineError::Input(e.to_string()))?;
            pipeline
                .verify(&frame, &gallery)
                .map_err(|e| EngineError::Internal(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
    }

    async fn report_match(&self, id: &IdentityId, similarity: f32, query: &Embedding) {
        match self.improvement.record_match(id, similarity, query).await {
            ImprovementOutcome::TemplateRefreshed => tracing::info!(identity = %id, "template refreshed"),
            ImprovementOutcome::PersistFailed => tracing::warn!(identity = %id, "template refresh deferred"),
            _ => {}
        }
    }

    async fn log_verification(&self, outcome: &VerificationOutcome) {
        let record = VerificationRecord::from_outcome(outcome, self.guard.provider_name());
        if let Err(e) = self.logs.append(&record).await {
            tracing::warn!(error = %e, "verification log write failed");
        }
    }

    /// Newest verification log entries for `id`.
    pub async fn verification_history(
        &self,
        id: &IdentityId,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, EngineError> {
        Ok(self.logs.recent_for(id, limit).await?)
    }

    /// Prefer a resolvable remote match over the local decision.
    async fn fuse(&self, local: &FrameAnalysis, remote: Result<GuardOutcome, ProviderError>) -> VerificationOutcome {
        let best = match remote {
            Ok(GuardOutcome::Completed(outcomes)) => outcomes
                .into_iter()
                .next()
                .and_then(|o| o.best_match.map(|m| (m, o.detection))),
            Ok(GuardOutcome::NoOpinion(reason)) => {
                tracing::debug!(?reason, "remote provider gave no opinion");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "remote verification failed, using local decision");
                None
            }
        };
        let Some((found, detection)) = best else {
            return local.outcome.clone();
        };
        if found.similarity < self.config.remote_similarity_threshold {
            return local.outcome.clone();
        }
        let identity = match self.resolve_remote(&found.face).await {
            Ok(Some(identity)) if identity.active => identity,
            Ok(_) => {
                tracing::warn!(face_id = %found.face.face_id, "remote match has no active local identity");
                return local.outcome.clone();
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot resolve remote match, using local decision");
                return local.outcome.clone();
            }
        };

        let is_live = local.outcome.is_live;
        VerificationOutcome {
            authorized: is_live,
            identity: Some(MatchedIdentity::from(&identity)),
            similarity: found.similarity,
            threshold: self.config.remote_similarity_threshold,
            liveness_score: local.outcome.liveness_score,
            is_live,
            emotion: detection.emotion.or_else(|| local.outcome.emotion.clone()),
            moving: false,
            face: local.outcome.face.clone().or(Some(detection.region)),
            source: DecisionSource::Remote,
            message: Some(if is_live { "verified" } else { "liveness check failed" }.into()),
        }
    }

    /// Local identity for a remote face: correlation id, then primary id,
    /// then remote face id.
    async fn resolve_remote(&self, face: &RemoteFace) -> Result<Option<FaceIdentity>, StoreError> {
        if let Some(correlation) = face.correlation_id.as_deref().filter(|c| !c.is_empty()) {
            if let Some(identity) = self.store.find_by_correlation_id(correlation).await? {
                return Ok(Some(identity));
            }
            if let Some(identity) = self.store.find_by_id(&IdentityId::from(correlation)).await? {
                return Ok(Some(identity));
            }
        }
        self.store.find_by_remote_face_id(&face.face_id).await
    }

    pub async fn register(&self, image: Vec<u8>, request: RegistrationRequest) -> Result<FaceIdentity, EngineError> {
        if image.is_empty() {
            return Err(EngineError::Input("empty image".into()));
        }
        let name = request.name.trim().to_string();
        let email = request.email.trim().to_string();
        if name.is_empty() || email.is_empty() {
            return Err(EngineError::Input("name and email are required".into()));
        }

        let pipeline = self.pipeline.clone();
        let bytes = image.clone();
        let analysis = tokio::task::spawn_blocking(move || {
            let frame = Frame::decode(&bytes).map_err(|e| EngineError::Input(e.to_string()))?;
            let faces = pipeline.detect(&frame);
            match faces.len() {
                0 => return Err(EngineError::Registration("no face detected".into())),
                1 => {}
                n => return Err(EngineError::Registration(format!("{n} faces detected, expected one"))),
            }
            pipeline
                .analyze_face(&frame, &faces[0])
                .map_err(|e| EngineError::Internal(e.to_string()))
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))??;

        if analysis.brightness < self.config.min_registration_brightness {
            return Err(EngineError::Registration(format!(
                "face too dark (brightness {:.0})",
                analysis.brightness
            )));
        }
        if analysis.liveness < self.config.min_registration_liveness {
            return Err(EngineError::Registration(format!(
                "liveness check failed (score {:.0})",
                analysis.liveness
            )));
        }
        if self.store.exists_by_email(&email).await? {
            return Err(EngineError::Registration("email already registered".into()));
        }

        let gallery = self.gallery().await?;
        let duplicate = self
            .pipeline
            .matcher()
            .best_match(&analysis.embedding, &gallery)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        if let Some(existing) = duplicate.candidate {
            if duplicate.similarity >= self.config.duplicate_threshold {
                tracing::warn!(existing = %existing.id, similarity = duplicate.similarity, "duplicate face at registration");
                return Err(EngineError::Registration("face already registered".into()));
            }
        }

        match self.guard.search(image.clone()).await {
            Ok(GuardOutcome::Completed(Some(found))) if found.similarity >= self.config.remote_similarity_threshold => {
                tracing::warn!(face_id = %found.face.face_id, "duplicate face in remote collection");
                return Err(EngineError::Registration("face already registered remotely".into()));
            }
            Ok(GuardOutcome::Completed(_)) => {}
            Ok(GuardOutcome::NoOpinion(reason)) => tracing::debug!(?reason, "remote duplicate check skipped"),
            Err(e) => tracing::warn!(error = %e, "remote duplicate check failed"),
        }

        let id = IdentityId::generate();
        let mut identity = FaceIdentity::new(id.clone(), name, email, analysis.embedding);
        identity.department = request.department;
        identity.position = request.position;

        let ext = image::guess_format(&image)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("img");
        let key = format!("faces/{id}.{ext}");
        match self.objects.upload(&key, &image).await {
            Ok(url) => {
                identity.image_url = Some(url);
                identity.image_key = Some(key);
            }
            Err(e) => tracing::warn!(identity = %id, error = %e, "reference image upload failed"),
        }

        match self.guard.index(image, id.to_string()).await {
            Ok(GuardOutcome::Completed(face_id)) => {
                identity.remote_face_id = Some(face_id);
                identity.correlation_id = Some(id.to_string());
            }
            Ok(GuardOutcome::NoOpinion(reason)) => {
                tracing::debug!(identity = %id, ?reason, "remote indexing skipped")
            }
            Err(e) => tracing::warn!(identity = %id, error = %e, "remote indexing failed"),
        }

        self.store.save(&identity).await?;
        tracing::info!(
            identity = %id,
            name = %identity.name,
            remote_face_id = identity.remote_face_id.as_deref().unwrap_or("none"),
            "identity registered"
        );
        Ok(identity)
    }

    pub async fn delete_identity(&self, id: &IdentityId) -> Result<(), EngineError> {
        let identity = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;

        if let Some(key) = &identity.image_key {
            if let Err(e) = self.objects.delete(key).await {
                tracing::warn!(identity = %id, error = %e, "reference image delete failed");
            }
        }
        if let Some(face_id) = &identity.remote_face_id {
            match self.guard.delete_faces(vec![face_id.clone()]).await {
                Ok(GuardOutcome::Completed(_)) => {}
                Ok(GuardOutcome::NoOpinion(reason)) => {
                    tracing::info!(identity = %id, ?reason, "remote face delete skipped, left for orphan cleanup")
                }
                Err(e) => tracing::warn!(identity = %id, error = %e, "remote face delete failed, left for orphan cleanup"),
            }
        }

        self.store.delete(id).await?;
        self.pipeline.thresholds().reset(id.as_str());
        self.improvement.reset(id);
        tracing::info!(identity = %id, "identity deleted");
        Ok(())
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self.store.find_all().await?.iter().map(FaceIdentity::summary).collect())
    }

    /// Clear adaptation history for one user, or everyone.
    pub fn reset_history(&self, user: Option<&str>) {
        match user {
            Some(user) => {
                self.pipeline.thresholds().reset(user);
                self.improvement.reset(&IdentityId::from(user));
            }
            None => {
                self.pipeline.thresholds().reset_all();
                self.improvement.reset_all();
            }
        }
        tracing::info!(user = user.unwrap_or("all"), "verification history reset");
    }

    pub fn set_provider_enabled(&self, enabled: bool) {
        self.guard.set_enabled(enabled);
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let extractor = self.pipeline.extractor();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            detector_available: self.detector_available,
            extractor: extractor.model_version().to_string(),
            embedding_dimension: extractor.dimension(),
            identities: self.store.count().await?,
            open_streams: self.streams.len(),
            thresholds: self.pipeline.thresholds().config().clone(),
            remote: self.guard.status(),
        })
    }

    pub async fn audit_sync(&self) -> Result<SyncAuditReport, SyncError> {
        self.reconciler.audit().await
    }

    pub async fn fix_sync(&self) -> Result<usize, SyncError> {
        self.reconciler.fix().await
    }

    pub async fn clean_orphans(&self) -> Result<usize, SyncError> {
        self.reconciler.clean().await
    }

    pub async fn recover_sync(&self) -> RecoveryReport {
        self.reconciler.recover().await
    }

    /// Log identities that cannot match and, with a provider, audit sync.
    pub async fn startup_integrity_check(&self) -> Result<IntegrityReport, EngineError> {
        let identities = self.store.find_all().await?;
        let running = self.pipeline.extractor().model_version();

        let mut empty_embeddings = Vec::new();
        let mut foreign_templates = 0;
        for identity in &identities {
            if identity.embedding.values.is_empty() || identity.embedding.is_zero() {
                tracing::warn!(identity = %identity.id, name = %identity.name, "identity has no usable embedding");
                empty_embeddings.push(identity.id.clone());
            } else if identity.embedding.model_version.as_deref().is_some_and(|v| v != running) {
                foreign_templates += 1;
            }
        }
        if foreign_templates > 0 {
            tracing::warn!(count = foreign_templates, extractor = running, "templates from another extractor");
        }

        let audit = if self.guard.provider_name().is_some() {
            match self.reconciler.audit().await {
                Ok(report) => {
                    if !report.orphaned.is_empty() {
                        tracing::warn!(orphaned = report.orphaned.len(), "orphaned remote faces at startup");
                    }
                    Some(report)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "startup sync audit failed");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            identities = identities.len(),
            empty = empty_embeddings.len(),
            "startup integrity check complete"
        );
        Ok(IntegrityReport {
            identities: identities.len(),
            empty_embeddings,
            foreign_templates,
            audit,
        })
    }
}

#[async_trait]
impl FrameVerifier for Engine {
    async fn verify_frame(&self, image: Vec<u8>) -> anyhow::Result<VerificationOutcome> {
        Ok(self.verify_single(image).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FsObjectStore;
    use crate::sqlite_store::SqliteIdentityStore;
    use facegate_core::detector::{DetectorError, FaceDetector};
    use facegate_core::improvement::ImprovementConfig;
    use facegate_core::matcher::CosineMatcher;
    use facegate_core::pipeline::PipelineConfig;
    use facegate_core::recognizer::{FeatureExtractor, RecognizerError};
    use facegate_core::threshold::AdaptiveThresholdPolicy;
    use facegate_core::{DetectionResult, MemoryIdentityStore};
    use facegate_remote::{GuardConfig, MemoryRecognizer, RemoteDetection, RemoteMatch};

    struct FixedDetector(Vec<DetectionResult>);

    impl FaceDetector for FixedDetector {
        fn detect(&self, _frame: &Frame) -> Result<Vec<DetectionResult>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Embedding chosen by the frame's overall brightness.
    struct BrightnessExtractor;

    impl FeatureExtractor for BrightnessExtractor {
        fn dimension(&self) -> usize {
            3
        }
        fn model_version(&self) -> &str {
            "brightness"
        }
        fn extract(&self, frame: &Frame, _face: &DetectionResult) -> Result<Embedding, RecognizerError> {
            let values = if frame.avg_brightness() < 140.0 {
                vec![1.0, 0.0, 0.0]
            } else {
                vec![0.0, 1.0, 0.0]
            };
            Ok(Embedding::new(values, "brightness"))
        }
    }

    fn face() -> DetectionResult {
        DetectionResult::new(10.0, 10.0, 160.0, 160.0, 0.9)
    }

    /// 200x200 textured grayscale PNG around `level`.
    fn png(level: u8) -> Vec<u8> {
        let img = image::GrayImage::from_fn(200, 200, |x, y| {
            let mut h = x.wrapping_mul(0x9E37_79B9) ^ y.wrapping_mul(0x85EB_CA6B);
            h ^= h >> 15;
            h = h.wrapping_mul(0x2C1B_3C6D);
            h ^= h >> 12;
            image::Luma([level.saturating_add((h % 8) as u8)])
        });
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    struct Harness {
        engine: Arc<Engine>,
        store: Arc<MemoryIdentityStore>,
        remote: Option<Arc<MemoryRecognizer>>,
        _dir: tempfile::TempDir,
    }

    async fn harness(faces: Vec<DetectionResult>, with_remote: bool) -> Harness {
        harness_with(faces, with_remote, EngineConfig::default()).await
    }

    async fn harness_with(faces: Vec<DetectionResult>, with_remote: bool, config: EngineConfig) -> Harness {
        let store = Arc::new(MemoryIdentityStore::new());
        let dir = tempfile::tempdir().unwrap();
        let remote = with_remote.then(|| Arc::new(MemoryRecognizer::new(100)));
        let provider = remote.clone().map(|r| r as Arc<dyn RemoteRecognizer>);
        let guard = Arc::new(ExternalServiceGuard::new(provider.clone(), GuardConfig::default()).unwrap());
        let pipeline = Arc::new(LocalPipeline::new(
            Arc::new(FixedDetector(faces)),
            Arc::new(BrightnessExtractor),
            Arc::new(CosineMatcher),
            Arc::new(AdaptiveThresholdPolicy::new(ThresholdConfig::default())),
            PipelineConfig::default(),
        ));
        let engine = Engine::new(EngineParts {
            config,
            consensus: ConsensusConfig::default(),
            pipeline,
            detector_available: true,
            store: store.clone(),
            logs: Arc::new(SqliteIdentityStore::open_in_memory().await.unwrap()),
            objects: Arc::new(FsObjectStore::new(dir.path())),
            remote: provider,
            guard,
            improvement: Arc::new(SelfImprovementTracker::new(ImprovementConfig::default(), store.clone())),
        });
        Harness {
            engine,
            store,
            remote,
            _dir: dir,
        }
    }

    fn request(name: &str) -> RegistrationRequest {
        RegistrationRequest {
            name: name.into(),
            email: format!("{name}@example.com"),
            department: Some("ops".into()),
            position: None,
        }
    }

    #[tokio::test]
    async fn test_register_then_verify() {
        let h = harness(vec![face()], false).await;
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        assert!(alice.image_key.is_some());
        assert!(alice.remote_face_id.is_none());

        let Verdict::Single(outcome) = h.engine.verify(vec![png(120)], false).await.unwrap() else {
            panic!("expected single-frame verdict");
        };
        assert!(outcome.authorized, "{:?}", outcome.message);
        assert_eq!(outcome.identity.unwrap().id, alice.id);
        assert_eq!(outcome.source, DecisionSource::Local);
        assert_eq!(h.engine.improvement.stats(&alice.id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_registration_rejections() {
        let h = harness(vec![face()], false).await;
        h.engine.register(png(120), request("alice")).await.unwrap();

        let err = h.engine.register(png(120), request("bob")).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration(ref m) if m == "face already registered"));

        let mut same_email = request("carol");
        same_email.email = "alice@example.com".into();
        let err = h.engine.register(png(180), same_email).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration(ref m) if m == "email already registered"));

        let err = h.engine.register(png(20), request("dark")).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration(ref m) if m.starts_with("face too dark")));

        assert!(matches!(
            h.engine.register(b"not an image".to_vec(), request("x")).await,
            Err(EngineError::Input(_))
        ));

        let none = harness(vec![], false).await;
        let err = none.engine.register(png(120), request("ghost")).await.unwrap_err();
        assert!(matches!(err, EngineError::Registration(ref m) if m == "no face detected"));

        let many = harness(vec![face(), DetectionResult::new(20.0, 20.0, 160.0, 160.0, 0.8)], false).await;
        assert!(matches!(
            many.engine.register(png(120), request("crowd")).await,
            Err(EngineError::Registration(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected() {
        let h = harness(vec![face()], false).await;
        assert!(matches!(h.engine.verify(vec![], false).await, Err(EngineError::Input(_))));
        assert!(matches!(h.engine.verify(vec![vec![]], false).await, Err(EngineError::Input(_))));
        assert!(matches!(
            h.engine.verify(vec![b"garbage".to_vec()], false).await,
            Err(EngineError::Input(_))
        ));
    }

    #[tokio::test]
    async fn test_live_batch_uses_consensus() {
        let h = harness(vec![face()], false).await;
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();

        let verdict = h.engine.verify(vec![png(120), png(121), png(122)], true).await.unwrap();
        let Verdict::Consensus(out) = verdict else {
            panic!("expected consensus verdict");
        };
        assert!(out.authorized);
        assert_eq!(out.identity.unwrap().id, alice.id);
        assert_eq!(out.message, "3 of 3 frames agreed");
    }

    #[tokio::test]
    async fn test_stream_buffers_until_full() {
        let h = harness(vec![face()], false).await;
        h.engine.register(png(120), request("alice")).await.unwrap();

        for _ in 0..2 {
            assert!(matches!(
                h.engine.verify_stream("cam-1", png(120)).await.unwrap(),
                Verdict::Single(_)
            ));
        }
        let third = h.engine.verify_stream("cam-1", png(120)).await.unwrap();
        assert!(matches!(third, Verdict::Consensus(_)));
        assert!(third.authorized());
        assert!(matches!(
            h.engine.verify_stream("cam-1", png(120)).await.unwrap(),
            Verdict::Single(_)
        ));
    }

    #[tokio::test]
    async fn test_remote_match_is_preferred() {
        let h = harness(vec![face()], true).await;
        let remote = h.remote.clone().unwrap();
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        let face_id = alice.remote_face_id.clone().unwrap();
        assert_eq!(alice.correlation_id.as_deref(), Some(alice.id.as_str()));
        assert!(remote.contains(&face_id));

        remote.set_detections(vec![RemoteDetection {
            region: face(),
            emotion: Some("Calm".into()),
        }]);
        remote.set_search_result(Some(RemoteMatch {
            face: facegate_remote::RemoteFace {
                face_id,
                correlation_id: Some(alice.id.to_string()),
            },
            similarity: 0.93,
        }));

        // a brighter frame embeds far from alice locally
        let outcome = h.engine.verify_single(png(150)).await.unwrap();
        assert!(outcome.authorized);
        assert_eq!(outcome.source, DecisionSource::Remote);
        assert_eq!(outcome.identity.unwrap().id, alice.id);
        assert_eq!(outcome.emotion.as_deref(), Some("Calm"));

        h.engine.set_provider_enabled(false);
        let outcome = h.engine.verify_single(png(150)).await.unwrap();
        assert!(!outcome.authorized);
        assert_eq!(outcome.source, DecisionSource::Local);
    }

    #[tokio::test]
    async fn test_remote_failure_falls_back_to_local() {
        let h = harness(vec![face()], true).await;
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        h.remote.as_ref().unwrap().fail_next(10);

        let outcome = h.engine.verify_single(png(120)).await.unwrap();
        assert!(outcome.authorized);
        assert_eq!(outcome.source, DecisionSource::Local);
        assert_eq!(outcome.identity.unwrap().id, alice.id);
        assert_eq!(h.engine.status().await.unwrap().remote.consecutive_errors, 1);
    }

    #[tokio::test]
    async fn test_delete_identity_cleans_everything() {
        let h = harness(vec![face()], true).await;
        let remote = h.remote.clone().unwrap();
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        h.engine.verify_single(png(120)).await.unwrap();

        h.engine.delete_identity(&alice.id).await.unwrap();
        assert!(h.store.find_by_id(&alice.id).await.unwrap().is_none());
        assert_eq!(remote.face_count(), 0);
        assert!(h.engine.improvement.stats(&alice.id).is_none());
        assert!(matches!(
            h.engine.delete_identity(&alice.id).await,
            Err(EngineError::NotFound(_))
        ));

        let outcome = h.engine.verify_single(png(120)).await.unwrap();
        assert!(!outcome.authorized);
    }

    #[tokio::test]
    async fn test_sustained_matches_refresh_template() {
        let h = harness(vec![face()], false).await;
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        for _ in 0..4 {
            h.engine.verify_single(png(120)).await.unwrap();
        }
        assert_eq!(h.engine.improvement.stats(&alice.id).unwrap().attempts, 4);
        h.engine.verify_single(png(120)).await.unwrap();
        assert!(h.engine.improvement.stats(&alice.id).is_none());
    }

    #[tokio::test]
    async fn test_integrity_check_and_status() {
        let h = harness(vec![face()], false).await;
        h.engine.register(png(120), request("alice")).await.unwrap();
        let broken = FaceIdentity::new(
            IdentityId::from("broken"),
            "Broken",
            "broken@example.com",
            Embedding::new(vec![], "brightness"),
        );
        h.store.save(&broken).await.unwrap();

        let report = h.engine.startup_integrity_check().await.unwrap();
        assert_eq!(report.identities, 2);
        assert_eq!(report.empty_embeddings, vec![IdentityId::from("broken")]);
        assert!(report.audit.is_none());

        let status = h.engine.status().await.unwrap();
        assert_eq!(status.identities, 2);
        assert_eq!(status.extractor, "brightness");
        assert!(status.remote.provider.is_none());
        assert_eq!(h.engine.list_identities().await.unwrap().len(), 2);

        // the empty template is skipped, not a matching error
        assert!(h.engine.verify_single(png(120)).await.unwrap().authorized);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_remote_registration_and_deletion() {
        let h = harness(vec![face()], true).await;
        let remote = h.remote.clone().unwrap();
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        let face_id = alice.remote_face_id.clone().unwrap();

        remote.fail_next(3);
        for _ in 0..3 {
            h.engine.verify_single(png(120)).await.unwrap();
        }
        assert_eq!(h.engine.status().await.unwrap().remote.circuit, "open");
        let before = remote.calls();

        let bob = h.engine.register(png(180), request("bob")).await.unwrap();
        assert!(bob.remote_face_id.is_none());
        assert!(bob.correlation_id.is_none());
        assert!(h.store.find_by_id(&bob.id).await.unwrap().is_some());

        h.engine.delete_identity(&alice.id).await.unwrap();
        assert!(h.store.find_by_id(&alice.id).await.unwrap().is_none());
        // left for orphan cleanup
        assert!(remote.contains(&face_id));
        assert_eq!(remote.calls(), before);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_not_called_at_registration() {
        let h = harness(vec![face()], true).await;
        let remote = h.remote.clone().unwrap();
        h.engine.set_provider_enabled(false);

        let alice = h.engine.register(png(120), request("alice")).await.unwrap();
        assert!(alice.remote_face_id.is_none());
        assert_eq!(remote.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_idle_streams_are_evicted() {
        let config = EngineConfig {
            stream_idle_ms: 1_000,
            ..EngineConfig::default()
        };
        let h = harness_with(vec![face()], false, config).await;
        h.engine.register(png(120), request("alice")).await.unwrap();

        for i in 0..5 {
            h.engine.verify_stream(&format!("cam-{i}"), png(120)).await.unwrap();
        }
        assert_eq!(h.engine.status().await.unwrap().open_streams, 5);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        // cam-0 restarts from an empty buffer, so two more frames stay single
        for _ in 0..2 {
            assert!(matches!(
                h.engine.verify_stream("cam-0", png(120)).await.unwrap(),
                Verdict::Single(_)
            ));
        }
        assert_eq!(h.engine.status().await.unwrap().open_streams, 1);
    }

    #[tokio::test]
    async fn test_verifications_are_logged_per_identity() {
        let h = harness(vec![face()], false).await;
        let alice = h.engine.register(png(120), request("alice")).await.unwrap();

        h.engine.verify_single(png(120)).await.unwrap();
        let rejected = h.engine.verify_single(png(200)).await.unwrap();
        assert!(!rejected.authorized);
        h.engine.verify_single(png(121)).await.unwrap();

        let history = h.engine.verification_history(&alice.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.authorized && r.provider == "local"));
        assert!(history[0].timestamp >= history[1].timestamp);
        assert_eq!(h.engine.verification_history(&alice.id, 1).await.unwrap().len(), 1);
        assert!(h
            .engine
            .verification_history(&IdentityId::from("nobody"), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
