//! Caffe SSD detector running on the OpenCV DNN module.

use opencv::{
    core::{self, Mat, Scalar, Size},
    dnn,
    imgproc,
    prelude::*,
};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{
    detector::{DetectError, Detection, DetectionEngine},
    ssd::{ModelLoadError, ModelSpec, decode_ssd_output},
};

pub struct CaffeSsdDetector {
    net: dnn::Net,
    input_size: (i32, i32),
    mean: Scalar,
    swap_rb: bool,
    min_confidence: f32,
}

impl CaffeSsdDetector {
    /// Read the prototxt/caffemodel pair. Fails before touching OpenCV when a
    /// file is missing.
    pub fn load(spec: &ModelSpec) -> Result<Self, ModelLoadError> {
        spec.verify()?;
        let backend_err = |err: opencv::Error| ModelLoadError::Backend {
            path: spec.weights.clone(),
            message: err.to_string(),
        };

        let net = dnn::read_net_from_caffe(
            &spec.prototxt.to_string_lossy(),
            &spec.weights.to_string_lossy(),
        )
        .map_err(backend_err)?;
        if net.empty().map_err(backend_err)? {
            return Err(ModelLoadError::Backend {
                path: spec.weights.clone(),
                message: "network has no layers".into(),
            });
        }
        debug!(
            prototxt = %spec.prototxt.display(),
            weights = %spec.weights.display(),
            "caffe network loaded"
        );

        Ok(Self {
            net,
            input_size: spec.input_size,
            mean: Scalar::new(spec.mean[0], spec.mean[1], spec.mean[2], 0.0),
            swap_rb: spec.swap_rb,
            min_confidence: spec.min_confidence,
        })
    }

    fn forward(&mut self, frame: &Frame, scale_factor: f64) -> opencv::Result<Mat> {
        let (in_w, in_h) = self.input_size;
        let flat = Mat::from_slice(&frame.data)?;
        let image = flat.reshape(3, frame.height)?;

        let mut resized = Mat::default();
        imgproc::resize(
            &image,
            &mut resized,
            Size::new(in_w, in_h),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        // The network expects BGR; annotated RGB frames need the opposite swap.
        let swap_rb = self.swap_rb ^ matches!(frame.format, FrameFormat::Rgb8);
        let blob = dnn::blob_from_image(
            &resized,
            scale_factor,
            Size::new(in_w, in_h),
            self.mean,
            swap_rb,
            false,
            core::CV_32F,
        )?;
        self.net.set_input_def(&blob)?;
        self.net.forward_single_def()
    }
}

impl DetectionEngine for CaffeSsdDetector {
    fn name(&self) -> &'static str {
        "caffe-ssd"
    }

    fn input_size(&self) -> (i32, i32) {
        self.input_size
    }

    fn detect(&mut self, frame: &Frame, scale_factor: f64) -> Result<Vec<Detection>, DetectError> {
        if !frame.is_well_formed() {
            return Err(DetectError::Frame {
                width: frame.width,
                height: frame.height,
                len: frame.data.len(),
            });
        }

        let output = self
            .forward(frame, scale_factor)
            .map_err(|err| DetectError::Backend(err.to_string()))?;
        let raw = output
            .data_typed::<f32>()
            .map_err(|err| DetectError::Backend(err.to_string()))?;
        decode_ssd_output(raw, frame.width, frame.height, self.min_confidence)
    }
}
