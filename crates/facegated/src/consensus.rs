//! Majority vote over independently verified frames.
//!
//! Frames are verified concurrently, each under its own timeout. A frame
//! that errors or times out is not responsive and is left out of the
//! denominator; a frame with no face is responsive and simply casts no vote.

use async_trait::async_trait;
use facegate_core::{IdentityId, MatchedIdentity, VerificationOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub frame_timeout_ms: u64,
    /// Fraction of responsive frames the winner must carry.
    pub majority_threshold: f32,
    /// Refuse a winner whose face never moved across frames.
    pub require_motion: bool,
    pub motion_threshold: f32,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 2_000,
            majority_threshold: 0.6,
            require_motion: false,
            motion_threshold: 1.0,
        }
    }
}

/// Verifies one encoded frame on its own.
#[async_trait]
pub trait FrameVerifier: Send + Sync {
    async fn verify_frame(&self, image: Vec<u8>) -> anyhow::Result<VerificationOutcome>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusOutcome {
    pub authorized: bool,
    pub identity: Option<MatchedIdentity>,
    /// Average confidence of the winning votes.
    pub score: f32,
    pub votes: usize,
    pub responsive_frames: usize,
    pub total_frames: usize,
    pub moving: bool,
    pub motion_score: f32,
    pub message: String,
}

/// The identity that carried the vote.
#[derive(Debug, Clone, PartialEq)]
pub struct Winner {
    pub identity: MatchedIdentity,
    pub votes: usize,
    pub average: f32,
    pub motion_score: f32,
}

impl ConsensusOutcome {
    pub fn success(winner: Winner, responsive_frames: usize, total_frames: usize) -> Self {
        Self {
            authorized: true,
            message: format!("{} of {} frames agreed", winner.votes, total_frames),
            identity: Some(winner.identity),
            score: winner.average,
            votes: winner.votes,
            responsive_frames,
            total_frames,
            moving: true,
            motion_score: winner.motion_score,
        }
    }

    /// A winner that did not satisfy the motion requirement.
    pub fn unconfirmed(winner: Winner, responsive_frames: usize, total_frames: usize) -> Self {
        Self {
            authorized: false,
            moving: false,
            message: format!(
                "{} of {} frames agreed but no motion was detected",
                winner.votes, total_frames
            ),
            ..Self::success(winner, responsive_frames, total_frames)
        }
    }

    pub fn failure(reason: impl Into<String>, responsive_frames: usize, total_frames: usize) -> Self {
        Self {
            authorized: false,
            identity: None,
            score: 0.0,
            votes: 0,
            responsive_frames,
            total_frames,
            moving: false,
            motion_score: 0.0,
            message: reason.into(),
        }
    }
}

pub struct MultiFrameConsensus {
    config: ConsensusConfig,
}

impl MultiFrameConsensus {
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    pub async fn verify(&self, frames: Vec<Vec<u8>>, verifier: Arc<dyn FrameVerifier>) -> ConsensusOutcome {
        let total = frames.len();
        if total == 0 {
            return ConsensusOutcome::failure("no frames provided", 0, 0);
        }
        let per_frame = Duration::from_millis(self.config.frame_timeout_ms);

        let handles: Vec<_> = frames
            .into_iter()
            .map(|frame| {
                let verifier = verifier.clone();
                tokio::spawn(async move { tokio::time::timeout(per_frame, verifier.verify_frame(frame)).await })
            })
            .collect();

        let mut responses = Vec::with_capacity(total);
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(Ok(outcome))) => responses.push(Some(outcome)),
                Ok(Ok(Err(e))) => {
                    tracing::warn!(frame = index, error = %e, "frame verification failed");
                    responses.push(None);
                }
                Ok(Err(_)) => {
                    tracing::warn!(frame = index, timeout_ms = self.config.frame_timeout_ms, "frame verification timed out");
                    responses.push(None);
                }
                Err(e) => {
                    tracing::warn!(frame = index, error = %e, "frame verification task aborted");
                    responses.push(None);
                }
            }
        }

        let outcome = self.consolidate(&responses);
        tracing::info!(
            authorized = outcome.authorized,
            votes = outcome.votes,
            responsive = outcome.responsive_frames,
            total = outcome.total_frames,
            score = outcome.score,
            "multi-frame consensus"
        );
        outcome
    }

    /// Fold per-frame results; `None` marks a non-responsive frame.
    pub fn consolidate(&self, responses: &[Option<VerificationOutcome>]) -> ConsensusOutcome {
        let total = responses.len();
        let responsive: Vec<&VerificationOutcome> = responses.iter().flatten().collect();
        if responsive.is_empty() {
            return ConsensusOutcome::failure("no frame produced a result", 0, total);
        }

        let mut tally: Vec<(MatchedIdentity, usize, f32)> = Vec::new();
        for outcome in &responsive {
            let Some(identity) = outcome.identity.as_ref().filter(|_| outcome.authorized) else {
                continue;
            };
            match tally.iter_mut().find(|(id, _, _)| id.id == identity.id) {
                Some((_, votes, sum)) => {
                    *votes += 1;
                    *sum += outcome.similarity;
                }
                None => tally.push((identity.clone(), 1, outcome.similarity)),
            }
        }
        if tally.is_empty() {
            return ConsensusOutcome::failure("no authorized face in any frame", responsive.len(), total);
        }

        let needed = self.config.majority_threshold;
        let mut best: Option<(MatchedIdentity, usize, f32)> = None;
        for (identity, votes, sum) in tally {
            if (votes as f32) / (responsive.len() as f32) < needed {
                continue;
            }
            let average = sum / votes as f32;
            if best.as_ref().map_or(true, |(_, _, b)| average > *b) {
                best = Some((identity, votes, average));
            }
        }
        let Some((identity, votes, average)) = best else {
            return ConsensusOutcome::failure("insufficient majority across frames", responsive.len(), total);
        };

        let motion_score = motion_score(&responsive, &identity.id);
        let winner = Winner {
            identity,
            votes,
            average,
            motion_score,
        };
        let moving = motion_score > self.config.motion_threshold;
        if self.config.require_motion && !moving {
            return ConsensusOutcome::unconfirmed(winner, responsive.len(), total);
        }
        ConsensusOutcome {
            moving,
            ..ConsensusOutcome::success(winner, responsive.len(), total)
        }
    }
}

/// Spread of the winner's face centres across frames, in pixels.
fn motion_score(responses: &[&VerificationOutcome], winner: &IdentityId) -> f32 {
    let centres: Vec<(f32, f32)> = responses
        .iter()
        .filter(|o| o.authorized && o.identity.as_ref().is_some_and(|i| &i.id == winner))
        .filter_map(|o| o.face.as_ref().map(|f| f.center()))
        .collect();
    if centres.len() < 2 {
        return 0.0;
    }
    let n = centres.len() as f32;
    let (mx, my) = centres.iter().fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
    let (mx, my) = (mx / n, my / n);
    let var_x = centres.iter().map(|(x, _)| (x - mx).powi(2)).sum::<f32>() / n;
    let var_y = centres.iter().map(|(_, y)| (y - my).powi(2)).sum::<f32>() / n;
    2.0 * (var_x + var_y).sqrt()
}
