//! facegate-core: local face verification engine.
//!
//! Detection (SCRFD via ONNX Runtime), feature extraction (ArcFace or a
//! model-free grid-statistics embedding), cosine matching, adaptive
//! thresholds, liveness heuristics and silent template refresh.

pub mod alignment;
pub mod detector;
pub mod frame;
pub mod history;
pub mod improvement;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod signals;
pub mod store;
pub mod threshold;
pub mod types;

pub use frame::Frame;
pub use store::{IdentityStore, MemoryIdentityStore, StoreError};
pub use types::{
    DecisionSource, DetectionResult, Embedding, FaceIdentity, IdentityId, IdentitySummary, MatchedIdentity,
    VerificationOutcome,
};
