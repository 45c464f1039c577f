use actix_web::web::Bytes;
use serde::Serialize;

/// One encoded, annotated frame as fanned out to every viewer.
#[derive(Clone, Debug)]
pub(crate) struct FramePacket {
    pub(crate) image: Bytes,
    pub(crate) content_type: &'static str,
    pub(crate) detections: Vec<DetectionSummary>,
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
}

/// Detection that made it onto the frame (above threshold, with a label).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct DetectionSummary {
    pub(crate) class: String,
    pub(crate) score: f32,
    /// `[left, top, right, bottom]` in frame pixels.
    pub(crate) bbox: [i32; 4],
}

#[derive(Serialize)]
pub(crate) struct DetectionsResponse<'a> {
    pub(crate) timestamp_ms: i64,
    pub(crate) frame_number: u64,
    pub(crate) fps: f32,
    pub(crate) detections: &'a [DetectionSummary],
}
