//! Single-shot detector model description and output decoding.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace};

use crate::detector::{BoundingBox, DetectError, Detection};

/// Values per SSD output row: `[image_id, class_id, confidence, x1, y1, x2, y2]`.
pub const SSD_ROW_LEN: usize = 7;
pub const DEFAULT_INPUT_SIZE: (i32, i32) = (300, 300);
pub const DEFAULT_MEAN: [f64; 3] = [127.5, 127.5, 127.5];
/// Multiplier applied after mean subtraction, maps `[0, 255]` to roughly `[-1, 1]`.
pub const DEFAULT_SCALE_FACTOR: f64 = 0.007843;
/// Rows below this score are dropped inside the engine.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.01;

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("failed to load model from {}: {message}", .path.display())]
    Backend { path: PathBuf, message: String },
    #[error("model has an invalid input size {0:?}")]
    InputSize((i32, i32)),
    #[error("no inference backend compiled in; rebuild with the `opencv` feature")]
    BackendUnavailable,
}

/// Files and preprocessing parameters of a Caffe SSD network.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub prototxt: PathBuf,
    pub weights: PathBuf,
    pub input_size: (i32, i32),
    /// Per-channel mean subtracted before scaling, in blob channel order.
    pub mean: [f64; 3],
    pub swap_rb: bool,
    pub min_confidence: f32,
}

impl ModelSpec {
    pub fn new(prototxt: impl Into<PathBuf>, weights: impl Into<PathBuf>) -> Self {
        Self {
            prototxt: prototxt.into(),
            weights: weights.into(),
            input_size: DEFAULT_INPUT_SIZE,
            mean: DEFAULT_MEAN,
            swap_rb: false,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    /// Check everything that can be checked without the inference backend.
    pub fn verify(&self) -> Result<(), ModelLoadError> {
        for path in [&self.prototxt, &self.weights] {
            if !is_file(path) {
                return Err(ModelLoadError::Missing(path.clone()));
            }
        }
        if self.input_size.0 <= 0 || self.input_size.1 <= 0 {
            return Err(ModelLoadError::InputSize(self.input_size));
        }
        debug!(
            prototxt = %self.prototxt.display(),
            weights = %self.weights.display(),
            input = ?self.input_size,
            "model files present"
        );
        Ok(())
    }
}

fn is_file(path: &Path) -> bool {
    path.metadata().map(|meta| meta.is_file()).unwrap_or(false)
}

/// Decode a flattened `[1, 1, N, 7]` SSD output into detections for a frame of
/// `width` x `height`.
///
/// Rows scoring below `min_confidence` (or NaN) are skipped. Confidence is
/// clamped into `[0, 1]` and boxes into the frame.
pub fn decode_ssd_output(
    raw: &[f32],
    width: i32,
    height: i32,
    min_confidence: f32,
) -> Result<Vec<Detection>, DetectError> {
    if raw.len() % SSD_ROW_LEN != 0 {
        return Err(DetectError::Output {
            len: raw.len(),
            row: SSD_ROW_LEN,
        });
    }

    let detections: Vec<Detection> = raw
        .chunks_exact(SSD_ROW_LEN)
        .filter(|row| row[2] >= min_confidence)
        .map(|row| Detection {
            class_id: row[1] as i64,
            confidence: row[2].clamp(0.0, 1.0),
            bbox: BoundingBox::from_normalized(row[3], row[4], row[5], row[6], width, height),
        })
        .collect();
    trace!(
        rows = raw.len() / SSD_ROW_LEN,
        kept = detections.len(),
        "decoded ssd output"
    );
    Ok(detections)
}
