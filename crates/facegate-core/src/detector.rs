//! Face detection.
//!
//! [`ScrfdDetector`] runs the SCRFD model (3-stride anchor-free decoding, NMS)
//! via ONNX Runtime. [`FailOpenDetector`] wraps any detector so that a model
//! that fails to load or run yields "no faces" instead of an error.

use crate::frame::{resize_bilinear, Frame};
use crate::types::DetectionResult;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Post-processing limits applied to every detector's raw output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    /// Minimum face width and height in pixels.
    pub min_face_size: f32,
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            min_face_size: 50.0,
            nms_threshold: 0.4,
        }
    }
}

/// Locates faces in a frame.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectionResult>, DetectorError>;
}

/// Clamp to image bounds, drop weak or small regions, order largest first.
pub fn finalize_detections(
    detections: Vec<DetectionResult>,
    width: u32,
    height: u32,
    config: &DetectorConfig,
) -> Vec<DetectionResult> {
    let mut kept: Vec<DetectionResult> = detections
        .into_iter()
        .filter(|d| d.confidence >= config.confidence_threshold)
        .map(|mut d| {
            d.clamp_to(width, height);
            d
        })
        .filter(|d| d.width >= config.min_face_size && d.height >= config.min_face_size)
        .collect();
    kept.sort_by(|a, b| b.area().total_cmp(&a.area()));
    kept
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Mutex<Session>,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
    config: DetectorConfig,
}

impl ScrfdDetector {
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_indices,
            config,
        })
    }

    fn run(&self, frame: &Frame) -> Result<Vec<DetectionResult>, DetectorError> {
        let (input, letterbox) = preprocess(frame);

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::InferenceFailed("session lock poisoned".into()))?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            all.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                self.config.confidence_threshold,
            ));
        }

        Ok(nms(all, self.config.nms_threshold))
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectionResult>, DetectorError> {
        let raw = self.run(frame)?;
        Ok(finalize_detections(raw, frame.width, frame.height, &self.config))
    }
}

/// Detector wrapper that never fails: a missing model or a runtime error
/// yields an empty result and a log line.
pub struct FailOpenDetector {
    inner: Option<Box<dyn FaceDetector>>,
}

impl FailOpenDetector {
    pub fn new(inner: Box<dyn FaceDetector>) -> Self {
        Self { inner: Some(inner) }
    }

    /// A detector that always reports no faces.
    pub fn unavailable() -> Self {
        Self { inner: None }
    }

    /// Load SCRFD from `model_path`. A load failure is logged once here and
    /// leaves the detector permanently empty.
    pub fn load_scrfd(model_path: &str, config: DetectorConfig) -> Self {
        match ScrfdDetector::load(model_path, config) {
            Ok(d) => Self::new(Box::new(d)),
            Err(e) => {
                tracing::error!(path = model_path, error = %e, "face detector unavailable, local detection disabled");
                Self::unavailable()
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_some()
    }
}

impl FaceDetector for FailOpenDetector {
    fn detect(&self, frame: &Frame) -> Result<Vec<DetectionResult>, DetectorError> {
        let Some(inner) = &self.inner else {
            return Ok(Vec::new());
        };
        match inner.detect(frame) {
            Ok(faces) => Ok(faces),
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed, treating frame as empty");
                Ok(Vec::new())
            }
        }
    }
}

/// Letterbox a grayscale frame into the NCHW SCRFD input tensor.
fn preprocess(frame: &Frame) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (frame.width as usize, frame.height as usize);
    let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);

    let new_w = ((width as f32 * scale).round() as usize).min(SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * scale).round() as usize).min(SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) as f32 / 2.0;

    let resized = resize_bilinear(&frame.data, width, height, new_w, new_h);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));

    for y in 0..SCRFD_INPUT_SIZE {
        for x in 0..SCRFD_INPUT_SIZE {
            let inside = y >= pad_y_start && y < pad_y_start + new_h && x >= pad_x_start && x < pad_x_start + new_w;
            let pixel = if inside {
                resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
            } else {
                SCRFD_MEAN
            };
            let normalized = (pixel - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y, x]] = normalized;
            }
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Map output tensors to stride slots by name ("score_8", "bbox_16", ...),
/// falling back to positional order [scores 8/16/32, bboxes, kps].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<DetectionResult> {
    let grid = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;
    let unmap = |x: f32, y: f32| ((x - letterbox.pad_x) / letterbox.scale, (y - letterbox.pad_y) / letterbox.scale);

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = unmap(ax - bboxes[bbox_off] * s, ay - bboxes[bbox_off + 1] * s);
        let (x2, y2) = unmap(ax + bboxes[bbox_off + 2] * s, ay + bboxes[bbox_off + 3] * s);

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| unmap(ax + kps[kps_off + i * 2] * s, ay + kps[kps_off + i * 2 + 1] * s))
        });

        detections.push(DetectionResult {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }
    detections
}

/// Non-Maximum Suppression, highest confidence wins.
fn nms(mut detections: Vec<DetectionResult>, iou_threshold: f32) -> Vec<DetectionResult> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<DetectionResult> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &DetectionResult, b: &DetectionResult) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
