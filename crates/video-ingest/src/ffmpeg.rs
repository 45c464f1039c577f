//! Dedicated camera capture through an `ffmpeg` subprocess.
//!
//! ffmpeg grabs the board camera over video4linux2 and writes packed `bgr24`
//! frames to stdout; a reader thread slices that pipe into [`Frame`]s.

use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    thread,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{Sender, bounded};
use tracing::debug;

use crate::{
    parse_device_index,
    source::FrameReceiver,
    types::{CaptureError, Frame, FrameFormat},
};

pub(crate) fn spawn_v4l2_reader(
    device: &str,
    target_size: (i32, i32),
    frame_rate: f64,
) -> Result<FrameReceiver, CaptureError> {
    let input = match parse_device_index(device) {
        Some(index) => format!("/dev/video{index}"),
        None => device.to_string(),
    };
    let (width, height) = target_size;

    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-f")
        .arg("video4linux2")
        .arg("-framerate")
        .arg(format!("{frame_rate}"))
        .arg("-video_size")
        .arg(format!("{width}x{height}"))
        .arg("-i")
        .arg(&input)
        .arg("-an")
        .arg("-vf")
        .arg(format!("scale={width}:{height}"))
        .arg("-pix_fmt")
        .arg("bgr24")
        .arg("-f")
        .arg("rawvideo")
        .arg("-");

    debug!(input = %input, "spawning ffmpeg capture");
    spawn_ffmpeg_reader(cmd, target_size, 2)
}

fn spawn_ffmpeg_reader(
    mut cmd: Command,
    target_size: (i32, i32),
    queue_size: usize,
) -> Result<FrameReceiver, CaptureError> {
    let (tx, rx) = bounded(queue_size);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = cmd.spawn().map_err(|err| CaptureError::Other(err.into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CaptureError::Other(anyhow!("failed to capture ffmpeg stdout")))?;

    thread::Builder::new()
        .name("capture-ffmpeg".into())
        .spawn(move || {
            let result = read_raw_frames(stdout, target_size, &tx);
            stop_child(child);
            if let Err(err) = result {
                let _ = tx.send(Err(err));
            }
        })
        .map_err(|err| CaptureError::Other(err.into()))?;

    Ok(rx)
}

/// Slice a raw `bgr24` byte stream into frames until the consumer hangs up.
///
/// End of stream means the camera went away and is reported as
/// [`CaptureError::Disconnected`]; a partial trailing frame is discarded.
pub(crate) fn read_raw_frames(
    mut reader: impl Read,
    target_size: (i32, i32),
    tx: &Sender<Result<Frame, CaptureError>>,
) -> Result<(), CaptureError> {
    let frame_bytes = Frame::expected_len(target_size.0, target_size.1, FrameFormat::Bgr8);
    if frame_bytes == 0 {
        return Err(CaptureError::Malformed {
            expected: 0,
            actual: 0,
        });
    }
    let mut buffer = vec![0u8; frame_bytes];

    loop {
        match reader.read_exact(&mut buffer) {
            Ok(()) => {
                let frame = Frame {
                    data: buffer.clone(),
                    width: target_size.0,
                    height: target_size.1,
                    timestamp_ms: Utc::now().timestamp_millis(),
                    format: FrameFormat::Bgr8,
                };
                if tx.send(Ok(frame)).is_err() {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(CaptureError::Disconnected);
            }
            Err(err) => return Err(CaptureError::Other(err.into())),
        }
    }
}

fn stop_child(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}
