//! Fixtures shared by the unit tests of the vision modules.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use actix_web::web::Bytes;
use ml_core::{BoundingBox, DetectError, Detection, DetectionEngine};
use video_ingest::{CaptureError, Frame, FrameFormat, FrameSource};

use crate::vision::data::{DetectionSummary, FramePacket};

pub(crate) fn packet(frame_number: u64) -> FramePacket {
    FramePacket {
        image: Bytes::from(format!("jpeg-{frame_number}")),
        content_type: "image/jpeg",
        detections: vec![DetectionSummary {
            class: "car".into(),
            score: 0.9,
            bbox: [10, 10, 50, 50],
        }],
        timestamp_ms: 1_700_000_000_000 + frame_number as i64,
        frame_number,
        fps: 30.0,
    }
}

/// Black BGR frame, like a camera pointed at nothing.
pub(crate) fn blank_frame(width: i32, height: i32) -> Frame {
    Frame {
        data: vec![0; Frame::expected_len(width, height, FrameFormat::Bgr8)],
        width,
        height,
        timestamp_ms: 1_700_000_000_000,
        format: FrameFormat::Bgr8,
    }
}

/// RGB frame whose pixels vary across both axes.
pub(crate) fn gradient_frame(width: i32, height: i32) -> Frame {
    let mut data = Vec::with_capacity(Frame::expected_len(width, height, FrameFormat::Rgb8));
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&[(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8]);
        }
    }
    Frame {
        data,
        width,
        height,
        timestamp_ms: 1_700_000_000_000,
        format: FrameFormat::Rgb8,
    }
}

pub(crate) fn car_detection() -> Detection {
    Detection {
        class_id: 7,
        confidence: 0.9,
        bbox: BoundingBox {
            left: 10,
            top: 10,
            right: 50,
            bottom: 50,
        },
    }
}

/// Frame source that hands out blank frames.
///
/// With a limit it fails with `Disconnected` once that many frames were read.
pub(crate) struct ScriptedSource {
    width: i32,
    height: i32,
    remaining: Option<usize>,
    pace: Duration,
    reads: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub(crate) fn endless(width: i32, height: i32, pace: Duration) -> Self {
        Self {
            width,
            height,
            remaining: None,
            pace,
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn finite(width: i32, height: i32, frames: usize) -> Self {
        Self {
            remaining: Some(frames),
            ..Self::endless(width, height, Duration::ZERO)
        }
    }

    pub(crate) fn counting(mut self, reads: Arc<AtomicUsize>) -> Self {
        self.reads = reads;
        self
    }
}

impl FrameSource for ScriptedSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return Err(CaptureError::Disconnected);
            }
            *remaining -= 1;
        }
        if !self.pace.is_zero() {
            thread::sleep(self.pace);
        }
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        let mut frame = blank_frame(self.width, self.height);
        frame.timestamp_ms += n as i64;
        Ok(frame)
    }

    fn describe(&self) -> &str {
        "scripted"
    }
}

/// Engine that reports the same detections for every frame.
pub(crate) struct ScriptedEngine {
    detections: Vec<Detection>,
    fail: bool,
}

impl ScriptedEngine {
    pub(crate) fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            detections: Vec::new(),
            fail: true,
        }
    }
}

impl DetectionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn input_size(&self) -> (i32, i32) {
        (300, 300)
    }

    fn detect(&mut self, _frame: &Frame, _scale_factor: f64) -> Result<Vec<Detection>, DetectError> {
        if self.fail {
            return Err(DetectError::Backend("scripted failure".into()));
        }
        Ok(self.detections.clone())
    }
}
