//! Compression of annotated frames into transmittable image buffers.
//!
//! Encoding is a pure function of the frame and the parameters, so two calls
//! with identical input yield byte-identical output.

use actix_web::web::Bytes;
use image::{
    ExtendedColorType, ImageEncoder, ImageError, RgbImage,
    codecs::{jpeg::JpegEncoder, png::PngEncoder},
};
use thiserror::Error;
use video_ingest::{Frame, FrameFormat};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EncodeFormat {
    #[default]
    Jpeg,
    Png,
}

impl EncodeFormat {
    pub(crate) fn content_type(self) -> &'static str {
        match self {
            EncodeFormat::Jpeg => "image/jpeg",
            EncodeFormat::Png => "image/png",
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum EncodeError {
    #[error("frame buffer holds {actual} bytes but {width}x{height} needs {expected}")]
    Malformed {
        width: i32,
        height: i32,
        expected: usize,
        actual: usize,
    },
    #[error("{format:?} encode failed: {source}")]
    Codec {
        format: EncodeFormat,
        #[source]
        source: ImageError,
    },
}

/// Encode `frame` as `format`. `quality` only applies to JPEG and is clamped
/// into `1..=100`.
pub(crate) fn encode_frame(
    frame: &Frame,
    format: EncodeFormat,
    quality: u8,
) -> Result<Bytes, EncodeError> {
    let rgb = frame_to_rgb(frame).ok_or_else(|| EncodeError::Malformed {
        width: frame.width,
        height: frame.height,
        expected: Frame::expected_len(frame.width, frame.height, frame.format),
        actual: frame.data.len(),
    })?;

    let mut buffer = Vec::with_capacity(frame.data.len() / 8);
    let result = match format {
        EncodeFormat::Jpeg => JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .encode_image(&rgb),
        EncodeFormat::Png => PngEncoder::new(&mut buffer).write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        ),
    };
    result.map_err(|source| EncodeError::Codec { format, source })?;

    Ok(Bytes::from(buffer))
}

/// View a well-formed frame as an RGB image, swapping channels for BGR input.
pub(crate) fn frame_to_rgb(frame: &Frame) -> Option<RgbImage> {
    if !frame.is_well_formed() {
        return None;
    }
    let data = match frame.format {
        FrameFormat::Rgb8 => frame.data.clone(),
        FrameFormat::Bgr8 => frame
            .data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
    };
    RgbImage::from_raw(frame.width as u32, frame.height as u32, data)
}
