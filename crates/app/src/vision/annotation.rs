use chrono::{Local, TimeZone};
use image::{Rgb, RgbImage};
use ml_core::{BoundingBox, ClassLabelTable, Detection};
use video_ingest::{Frame, FrameFormat};

use crate::vision::{data::DetectionSummary, encoding::frame_to_rgb};

pub(crate) const DETECTION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub(crate) const TIMESTAMP_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";
/// Timestamp anchor measured from the bottom-right corner.
const TIMESTAMP_OFFSET: (i32, i32) = (150, 20);
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const LABEL_GAP: i32 = 5;

/// A detection that will be drawn.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Overlay {
    pub(crate) bbox: BoundingBox,
    pub(crate) label: String,
    pub(crate) confidence: f32,
}

impl Overlay {
    pub(crate) fn text(&self) -> String {
        format!("{} : {}", self.label, self.confidence)
    }

    pub(crate) fn summary(&self) -> DetectionSummary {
        DetectionSummary {
            class: self.label.clone(),
            score: self.confidence,
            bbox: [
                self.bbox.left,
                self.bbox.top,
                self.bbox.right,
                self.bbox.bottom,
            ],
        }
    }
}

/// Draws detection boxes, their labels and the capture time onto frames.
#[derive(Clone, Debug)]
pub(crate) struct Annotator {
    confidence_threshold: f32,
    labels: ClassLabelTable,
}

impl Annotator {
    pub(crate) fn new(confidence_threshold: f32, labels: ClassLabelTable) -> Self {
        Self {
            confidence_threshold,
            labels,
        }
    }

    /// Select what gets drawn: detections at or above the threshold whose
    /// class has a label, with boxes clamped to the frame. Unlabelled classes
    /// are skipped without affecting the others.
    pub(crate) fn overlays(&self, frame: &Frame, detections: &[Detection]) -> Vec<Overlay> {
        detections
            .iter()
            .filter(|det| det.confidence >= self.confidence_threshold)
            .filter_map(|det| {
                let label = self.labels.get(det.class_id)?;
                Some(Overlay {
                    bbox: det.bbox.clamp_to(frame.width, frame.height),
                    label: label.to_string(),
                    confidence: det.confidence,
                })
            })
            .collect()
    }

    pub(crate) fn annotate(&self, frame: Frame, detections: &[Detection]) -> Frame {
        let overlays = self.overlays(&frame, detections);
        self.render(frame, &overlays)
    }

    /// Rasterise `overlays` and the timestamp. The output keeps the input's
    /// dimensions and is RGB8. A malformed frame is handed back untouched so
    /// the encoder can reject it.
    pub(crate) fn render(&self, frame: Frame, overlays: &[Overlay]) -> Frame {
        let Some(mut image) = frame_to_rgb(&frame) else {
            return frame;
        };
        let width = frame.width;
        let height = frame.height;

        for overlay in overlays {
            let bbox = overlay.bbox;
            draw_rectangle(
                &mut image,
                bbox.left,
                bbox.top,
                bbox.right,
                bbox.bottom,
                DETECTION_COLOR,
            );
            let (x, y) = label_origin(&bbox);
            draw_label(&mut image, x, y, &overlay.text(), DETECTION_COLOR);
        }

        let stamp = timestamp_text(frame.timestamp_ms);
        draw_label(
            &mut image,
            (width - TIMESTAMP_OFFSET.0).max(0),
            (height - TIMESTAMP_OFFSET.1).max(0),
            &stamp,
            TIMESTAMP_COLOR,
        );

        Frame {
            data: image.into_raw(),
            width,
            height,
            timestamp_ms: frame.timestamp_ms,
            format: FrameFormat::Rgb8,
        }
    }
}

/// Label sits just above the box, or inside it when the box touches the top.
fn label_origin(bbox: &BoundingBox) -> (i32, i32) {
    let above = bbox.top - GLYPH_HEIGHT - LABEL_GAP;
    if above >= 0 {
        (bbox.left, above)
    } else {
        (bbox.left + 2, bbox.top + 2)
    }
}

/// Capture time rendered in the local timezone.
pub(crate) fn timestamp_text(timestamp_ms: i64) -> String {
    Local
        .timestamp_millis_opt(timestamp_ms)
        .earliest()
        .map(|time| time.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    if width == 0 || height == 0 {
        return;
    }
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

/// 5x7 bitmap font, one byte per row with the leftmost pixel in bit 4.
fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0, 0, 0, 0, 0, 0, 0],
        _ => return None,
    };
    Some(rows)
}
