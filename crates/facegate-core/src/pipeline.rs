//! Local verification of one decoded frame: detect, extract, match against
//! the gallery with an adaptive threshold, gate on liveness.

use crate::detector::FaceDetector;
use crate::frame::Frame;
use crate::matcher::SimilarityMatcher;
use crate::recognizer::{FeatureExtractor, RecognizerError};
use crate::signals;
use crate::threshold::AdaptiveThresholdPolicy;
use crate::types::{DecisionSource, DetectionResult, Embedding, FaceIdentity, MatchError, VerificationOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("feature extraction: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("matching: {0}")]
    Match(#[from] MatchError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum liveness score (0–100) for an authorization.
    pub liveness_threshold: f32,
    /// Liveness below this is reported as a likely spoof.
    pub spoof_below: f32,
    /// Faces per frame considered for matching, largest first.
    pub max_faces: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: 45.0,
            spoof_below: 20.0,
            max_faces: 3,
        }
    }
}

/// Per-face measurements independent of the gallery.
#[derive(Debug, Clone)]
pub struct FaceAnalysis {
    pub face: DetectionResult,
    pub embedding: Embedding,
    pub liveness: f32,
    pub emotion: &'static str,
    /// Mean brightness of the face crop.
    pub brightness: f32,
}

#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    pub outcome: VerificationOutcome,
    /// Embedding of the face the outcome describes.
    pub query: Option<Embedding>,
    /// Mean brightness of the whole frame.
    pub brightness: f32,
}

pub struct LocalPipeline {
    detector: Arc<dyn FaceDetector>,
    extractor: Arc<dyn FeatureExtractor>,
    matcher: Arc<dyn SimilarityMatcher>,
    thresholds: Arc<AdaptiveThresholdPolicy>,
    config: PipelineConfig,
}

impl LocalPipeline {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        extractor: Arc<dyn FeatureExtractor>,
        matcher: Arc<dyn SimilarityMatcher>,
        thresholds: Arc<AdaptiveThresholdPolicy>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            extractor,
            matcher,
            thresholds,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn thresholds(&self) -> &AdaptiveThresholdPolicy {
        &self.thresholds
    }

    pub fn extractor(&self) -> &dyn FeatureExtractor {
        self.extractor.as_ref()
    }

    pub fn matcher(&self) -> &dyn SimilarityMatcher {
        self.matcher.as_ref()
    }

    /// Faces in the frame, largest first. Detector errors read as "no faces".
    pub fn detect(&self, frame: &Frame) -> Vec<DetectionResult> {
        self.detector.detect(frame).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "face detection failed");
            Vec::new()
        })
    }

    pub fn analyze_face(&self, frame: &Frame, face: &DetectionResult) -> Result<FaceAnalysis, PipelineError> {
        let embedding = self.extractor.extract(frame, face)?;
        let (liveness, emotion, brightness) = match frame.crop(face) {
            Some(crop) => (
                signals::liveness_score(&crop),
                signals::expression_label(&crop),
                crop.avg_brightness(),
            ),
            None => (0.0, "Neutral", 0.0),
        };
        Ok(FaceAnalysis {
            face: face.clone(),
            embedding,
            liveness,
            emotion,
            brightness,
        })
    }

    /// Verify one frame against `gallery` and record the attempt for the
    /// best candidate.
    pub fn verify(&self, frame: &Frame, gallery: &[FaceIdentity]) -> Result<FrameAnalysis, PipelineError> {
        let brightness = frame.avg_brightness();
        let faces = self.detect(frame);
        if faces.is_empty() {
            tracing::debug!(brightness, "no face in frame");
            return Ok(FrameAnalysis {
                outcome: VerificationOutcome::no_face(DecisionSource::Local),
                query: None,
                brightness,
            });
        }

        let mut best: Option<(VerificationOutcome, Embedding)> = None;
        for face in faces.iter().take(self.config.max_faces.max(1)) {
            let analysis = self.analyze_face(frame, face)?;
            let outcome = self.decide(&analysis, gallery, brightness)?;
            let replace = match &best {
                None => true,
                Some((current, _)) => outranks(&outcome, current),
            };
            if replace {
                best = Some((outcome, analysis.embedding));
            }
        }

        let Some((outcome, query)) = best else {
            return Ok(FrameAnalysis {
                outcome: VerificationOutcome::no_face(DecisionSource::Local),
                query: None,
                brightness,
            });
        };

        if let Some(identity) = &outcome.identity {
            self.thresholds.record_attempt(identity.id.as_str(), outcome.similarity);
        }
        tracing::debug!(
            authorized = outcome.authorized,
            similarity = outcome.similarity,
            threshold = outcome.threshold,
            liveness = outcome.liveness_score,
            lighting = ?self.thresholds.lighting_condition(brightness),
            "local verification"
        );

        Ok(FrameAnalysis {
            outcome,
            query: Some(query),
            brightness,
        })
    }

    fn decide(
        &self,
        analysis: &FaceAnalysis,
        gallery: &[FaceIdentity],
        brightness: f32,
    ) -> Result<VerificationOutcome, PipelineError> {
        let result = self.matcher.best_match(&analysis.embedding, gallery)?;
        let user = result.candidate.as_ref().map(|c| c.id.as_str());
        let threshold = self.thresholds.threshold_for(brightness, user);

        let is_live = analysis.liveness >= self.config.liveness_threshold;
        let matched = result.candidate.is_some() && self.matcher.is_authorized(result.similarity, threshold);
        let authorized = matched && is_live;

        let message = if result.candidate.is_none() {
            "no enrolled identities"
        } else if !matched {
            "face not recognized"
        } else if analysis.liveness < self.config.spoof_below {
            "possible spoof attempt"
        } else if !is_live {
            "liveness check failed"
        } else {
            "verified"
        };

        Ok(VerificationOutcome {
            authorized,
            identity: result.candidate,
            similarity: result.similarity,
            threshold,
            liveness_score: analysis.liveness,
            is_live,
            emotion: Some(analysis.emotion.to_string()),
            moving: false,
            face: Some(analysis.face.clone()),
            source: DecisionSource::Local,
            message: Some(message.to_string()),
        })
    }
}

/// Authorized outcomes first, then higher similarity.
fn outranks(a: &VerificationOutcome, b: &VerificationOutcome) -> bool {
    (a.authorized, a.similarity) > (b.authorized, b.similarity)
}
