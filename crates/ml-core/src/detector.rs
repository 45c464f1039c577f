use thiserror::Error;
use video_ingest::Frame;

/// Axis-aligned box in pixel coordinates of the frame it was detected in.
///
/// Constructors clamp so that `0 <= left <= right <= width` and
/// `0 <= top <= bottom <= height` always hold for the frame they were built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    pub fn clamped(left: i32, top: i32, right: i32, bottom: i32, width: i32, height: i32) -> Self {
        let width = width.max(0);
        let height = height.max(0);
        let left = left.clamp(0, width);
        let top = top.clamp(0, height);
        Self {
            left,
            top,
            right: right.clamp(left, width),
            bottom: bottom.clamp(top, height),
        }
    }

    /// Scale normalised `[0, 1]` corners to pixels, truncating like an integer
    /// cast, then clamp to the frame.
    pub fn from_normalized(x1: f32, y1: f32, x2: f32, y2: f32, width: i32, height: i32) -> Self {
        let scale = |value: f32, extent: i32| {
            if value.is_finite() {
                (value * extent as f32) as i32
            } else {
                0
            }
        };
        Self::clamped(
            scale(x1, width),
            scale(y1, height),
            scale(x2, width),
            scale(y2, height),
            width,
            height,
        )
    }

    /// Re-apply the frame bounds, e.g. to a box built by hand.
    pub fn clamp_to(self, width: i32, height: i32) -> Self {
        Self::clamped(self.left, self.top, self.right, self.bottom, width, height)
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }
}

/// Single detection returned by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    /// Detector score in `[0, 1]`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("frame of {width}x{height} with {len} bytes cannot be fed to the detector")]
    Frame { width: i32, height: i32, len: usize },
    #[error("detector output has {len} values, not a multiple of {row}")]
    Output { len: usize, row: usize },
    #[error("inference backend failed: {0}")]
    Backend(String),
}

/// Object detector behind the frame pipeline.
///
/// `detect` takes `&mut self`: one forward pass mutates the network's state,
/// so a shared engine must be owned by a single caller at a time.
pub trait DetectionEngine: Send {
    /// Backend identifier used in logs.
    fn name(&self) -> &'static str;

    /// Fixed (width, height) the model consumes.
    fn input_size(&self) -> (i32, i32);

    /// Run one forward pass. Boxes are in pixels of `frame`. Nothing below the
    /// engine's internal floor is returned; user-facing thresholds are applied
    /// by the caller.
    fn detect(&mut self, frame: &Frame, scale_factor: f64) -> Result<Vec<Detection>, DetectError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamping_keeps_corners_ordered_inside_the_frame() {
        let bbox = BoundingBox::clamped(-20, -5, 400, 350, 300, 200);
        assert_eq!(
            bbox,
            BoundingBox {
                left: 0,
                top: 0,
                right: 300,
                bottom: 200
            }
        );

        let inverted = BoundingBox::clamped(120, 90, 40, 10, 300, 200);
        assert!(inverted.left <= inverted.right);
        assert!(inverted.top <= inverted.bottom);
        assert_eq!(inverted.width(), 0);
        assert_eq!(inverted.height(), 0);
    }

    #[test]
    fn normalized_corners_truncate_to_pixels() {
        let bbox = BoundingBox::from_normalized(0.1, 0.25, 0.505, 1.2, 300, 200);
        assert_eq!(
            bbox,
            BoundingBox {
                left: 30,
                top: 50,
                right: 151,
                bottom: 200
            }
        );

        let garbage = BoundingBox::from_normalized(f32::NAN, 0.0, f32::INFINITY, 0.5, 300, 200);
        assert_eq!(garbage.left, 0);
        assert_eq!(garbage.right, 0);
    }
}
