use std::time::Duration;

use anyhow::Error;
use thiserror::Error;

/// Raw frame captured from a video source.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

impl Frame {
    /// Byte length a packed frame of this size and format must have.
    pub fn expected_len(width: i32, height: i32, format: FrameFormat) -> usize {
        (width.max(0) as usize) * (height.max(0) as usize) * format.bytes_per_pixel()
    }

    /// True when the buffer is non-empty and matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == Self::expected_len(self.width, self.height, self.format)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameFormat {
    /// Packed 8-bit blue/green/red, as delivered by cameras.
    Bgr8,
    /// Packed 8-bit red/green/blue, as produced by the annotator.
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        3
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error("video source disconnected")]
    Disconnected,
    #[error("no frame received within {0:?}")]
    Timeout(Duration),
    #[error("frame buffer holds {actual} bytes, expected {expected}")]
    Malformed { expected: usize, actual: usize },
    #[error("capture backend unavailable: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Settings used to open a capture device.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Device index (`0`), device node (`/dev/video0`) or any URI OpenCV accepts.
    pub device: String,
    /// Capture the board camera through an `ffmpeg` video4linux2 pipe instead of OpenCV.
    pub dedicated_camera: bool,
    pub width: i32,
    pub height: i32,
    pub frame_rate: f64,
    /// Pause observed once before the first frame is handed out.
    pub warmup: Duration,
    /// Fail a read that waits longer than this. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
}
