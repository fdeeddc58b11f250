//! Feature extraction: turns a detected face into a fixed-length embedding.
//!
//! Two extractors are provided. [`ArcFaceExtractor`] runs the w600k_r50
//! ArcFace model on a landmark-aligned crop. [`GridStatsExtractor`] needs no
//! model: it summarises a contrast-normalised crop as per-cell mean/std
//! statistics, giving a deterministic 128-value embedding.

use crate::alignment;
use crate::frame::{clahe_enhance, mean_std, Frame};
use crate::types::{DetectionResult, Embedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

const GRID_CROP_SIZE: u32 = 160;
const GRID_CELLS: usize = 8;
const GRID_MODEL_VERSION: &str = "grid-stats-v1";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks, alignment impossible")]
    NoLandmarks,
    #[error("face region lies outside the frame")]
    EmptyRegion,
    #[error("extractor produced {actual} values, expected {expected}")]
    WrongDimension { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces embeddings of a fixed, extractor-specific length.
pub trait FeatureExtractor: Send + Sync {
    fn dimension(&self) -> usize;
    fn model_version(&self) -> &str;
    fn extract(&self, frame: &Frame, face: &DetectionResult) -> Result<Embedding, RecognizerError>;
}

/// ArcFace-based extractor (512-d, L2-normalized).
pub struct ArcFaceExtractor {
    session: Mutex<Session>,
}

impl ArcFaceExtractor {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    /// Pack a 112x112 grayscale aligned crop into a 3-channel NCHW tensor.
    fn preprocess(aligned: &Frame) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let pixel = aligned.data.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - ARCFACE_MEAN) / ARCFACE_STD;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = normalized;
                }
            }
        }
        tensor
    }
}

impl FeatureExtractor for ArcFaceExtractor {
    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn extract(&self, frame: &Frame, face: &DetectionResult) -> Result<Embedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned = alignment::align_face(frame, landmarks);
        let input = Self::preprocess(&aligned);

        let mut session = self
            .session
            .lock()
            .map_err(|_| RecognizerError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::WrongDimension {
                expected: ARCFACE_EMBEDDING_DIM,
                actual: raw.len(),
            });
        }

        Ok(Embedding::new(raw.to_vec(), ARCFACE_MODEL_VERSION).normalized())
    }
}

/// Model-free extractor: 8x8 grid of (mean, std) over a 160x160 CLAHE crop,
/// zero-centred and L2-normalized.
#[derive(Debug, Default, Clone)]
pub struct GridStatsExtractor;

impl GridStatsExtractor {
    pub fn new() -> Self {
        Self
    }

    fn features(crop: &Frame) -> Vec<f32> {
        let size = GRID_CROP_SIZE as usize;
        let cell = size / GRID_CELLS;
        let mut values = Vec::with_capacity(GRID_CELLS * GRID_CELLS * 2);

        for row in 0..GRID_CELLS {
            for col in 0..GRID_CELLS {
                let pixels = (row * cell..(row + 1) * cell).flat_map(|y| {
                    let start = y * size + col * cell;
                    crop.data[start..start + cell].iter().copied()
                });
                let (mean, std) = mean_std(pixels);
                values.push(mean / 255.0);
                values.push(std / 255.0);
            }
        }

        let centre = values.iter().sum::<f32>() / values.len() as f32;
        for v in values.iter_mut() {
            *v -= centre;
        }
        values
    }
}

impl FeatureExtractor for GridStatsExtractor {
    fn dimension(&self) -> usize {
        GRID_CELLS * GRID_CELLS * 2
    }

    fn model_version(&self) -> &str {
        GRID_MODEL_VERSION
    }

    fn extract(&self, frame: &Frame, face: &DetectionResult) -> Result<Embedding, RecognizerError> {
        let mut crop = frame
            .crop(face)
            .ok_or(RecognizerError::EmptyRegion)?
            .resize(GRID_CROP_SIZE, GRID_CROP_SIZE);
        clahe_enhance(&mut crop.data, crop.width, crop.height, 4, 0.02);

        let values = Self::features(&crop);
        if values.len() != self.dimension() {
            return Err(RecognizerError::WrongDimension {
                expected: self.dimension(),
                actual: values.len(),
            });
        }
        Ok(Embedding::new(values, GRID_MODEL_VERSION).normalized())
    }
}
