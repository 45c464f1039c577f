use std::{thread, time::Duration};

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::debug;

use crate::types::{CaptureError, Frame};

pub(crate) type FrameReceiver = Receiver<Result<Frame, CaptureError>>;

/// Blocking producer of raw frames.
///
/// `read` either returns a complete frame or an error; it never hands out a
/// zero-filled or truncated buffer.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Frame, CaptureError>;

    /// Human readable identifier used in logs.
    fn describe(&self) -> &str;
}

/// [`FrameSource`] backed by a reader thread feeding a channel.
///
/// Dropping the source drops the receiver, which makes the reader thread's
/// next send fail and releases the device.
pub struct ChannelSource {
    rx: FrameReceiver,
    label: String,
    warmup: Option<Duration>,
    read_timeout: Option<Duration>,
}

impl ChannelSource {
    pub fn new(
        rx: FrameReceiver,
        label: impl Into<String>,
        warmup: Duration,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            rx,
            label: label.into(),
            warmup: (!warmup.is_zero()).then_some(warmup),
            read_timeout,
        }
    }

    fn next_message(&self) -> Result<Result<Frame, CaptureError>, CaptureError> {
        match self.read_timeout {
            Some(limit) => self.rx.recv_timeout(limit).map_err(|err| match err {
                RecvTimeoutError::Timeout => CaptureError::Timeout(limit),
                RecvTimeoutError::Disconnected => CaptureError::Disconnected,
            }),
            None => self.rx.recv().map_err(|_| CaptureError::Disconnected),
        }
    }

    /// Sleep through the warm-up, then skip every frame the reader captured
    /// before it ended. The reader keeps running while we sleep, so the queue
    /// holds frames from right after the device opened.
    fn first_settled_frame(&self, delay: Duration) -> Result<Frame, CaptureError> {
        debug!(source = %self.label, "warming up capture device for {delay:?}");
        let settled_at = Utc::now()
            .timestamp_millis()
            .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
        thread::sleep(delay);

        let mut skipped = 0usize;
        loop {
            let frame = self.next_message()??;
            if frame.timestamp_ms >= settled_at {
                if skipped > 0 {
                    debug!(source = %self.label, skipped, "dropped frames captured during warm-up");
                }
                return Ok(frame);
            }
            skipped += 1;
        }
    }
}

impl FrameSource for ChannelSource {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let frame = match self.warmup.take() {
            Some(delay) => self.first_settled_frame(delay)?,
            None => self.next_message()??,
        };
        if !frame.is_well_formed() {
            return Err(CaptureError::Malformed {
                expected: Frame::expected_len(frame.width, frame.height, frame.format),
                actual: frame.data.len(),
            });
        }
        Ok(frame)
    }

    fn describe(&self) -> &str {
        &self.label
    }
}
