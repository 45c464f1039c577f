//! Capture backends that turn a camera into a blocking stream of BGR frames.
//!
//! Every backend runs on its own thread and feeds a small bounded channel, so a
//! slow consumer back-pressures the device instead of queueing stale frames.
//! Consumers only see the [`FrameSource`] trait returned by [`open`].

#[cfg(feature = "opencv")]
mod camera;
mod ffmpeg;
mod source;
mod types;

pub use source::{ChannelSource, FrameSource};
pub use types::{CaptureConfig, CaptureError, Frame, FrameFormat};

/// Open the device described by `config`.
///
/// The warm-up delay is not observed here; it is paid by the first
/// [`FrameSource::read`] so opening never blocks the caller.
pub fn open(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let target_size = (config.width, config.height);
    let rx = if config.dedicated_camera {
        ffmpeg::spawn_v4l2_reader(&config.device, target_size, config.frame_rate)?
    } else {
        open_device(config)?
    };
    tracing::debug!(
        device = %config.device,
        dedicated = config.dedicated_camera,
        width = config.width,
        height = config.height,
        fps = config.frame_rate,
        "capture source opened"
    );

    Ok(Box::new(ChannelSource::new(
        rx,
        config.device.clone(),
        config.warmup,
        config.read_timeout,
    )))
}

#[cfg(feature = "opencv")]
fn open_device(config: &CaptureConfig) -> Result<source::FrameReceiver, CaptureError> {
    camera::spawn_camera_reader(
        &config.device,
        (config.width, config.height),
        config.frame_rate,
    )
}

#[cfg(not(feature = "opencv"))]
fn open_device(_config: &CaptureConfig) -> Result<source::FrameReceiver, CaptureError> {
    Err(CaptureError::Unsupported(
        "device capture needs the `opencv` feature; use dedicated camera mode instead",
    ))
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}
