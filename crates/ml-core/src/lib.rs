//! Detection engine interface and the pieces around it: SSD output decoding,
//! model file description and class label tables.
//!
//! Enable the `opencv` feature to get the Caffe backend used by
//! [`load_engine`].

#[cfg(feature = "opencv")]
pub mod caffe;
pub mod detector;
pub mod labels;
pub mod ssd;

#[cfg(feature = "opencv")]
pub use caffe::CaffeSsdDetector;
pub use detector::{BoundingBox, DetectError, Detection, DetectionEngine};
pub use labels::{ClassLabelTable, LabelError};
pub use ssd::{ModelLoadError, ModelSpec, decode_ssd_output};

/// Load the engine described by `spec` with the backend compiled in.
#[cfg(feature = "opencv")]
pub fn load_engine(spec: &ModelSpec) -> Result<Box<dyn DetectionEngine>, ModelLoadError> {
    Ok(Box::new(CaffeSsdDetector::load(spec)?))
}

/// Without a backend the model files are still verified, so a bad path is
/// reported as such rather than as a missing feature.
#[cfg(not(feature = "opencv"))]
pub fn load_engine(spec: &ModelSpec) -> Result<Box<dyn DetectionEngine>, ModelLoadError> {
    spec.verify()?;
    Err(ModelLoadError::BackendUnavailable)
}
