//! The single producer: capture, detect, annotate and encode once per tick,
//! then publish the packet to every viewer.
//!
//! The producer thread is the only owner of the detection engine, so there is
//! never more than one inference in flight no matter how many viewers are
//! attached. Capture failures are supervised here: the hub is interrupted, the
//! device is released and reopened after a backoff while the HTTP server keeps
//! accepting connections.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ml_core::{DetectError, DetectionEngine};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::{CaptureError, Frame, FrameSource};

use crate::vision::{
    annotation::Annotator,
    data::FramePacket,
    encoding::{EncodeError, EncodeFormat, encode_frame},
    hub::FrameHub,
    telemetry::spawn_thread,
};

/// Reopen delay after a capture failure.
pub(crate) const CAPTURE_BACKOFF: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Why a tick produced nothing. The frame is dropped and the loop continues.
#[derive(Debug, Error)]
pub(crate) enum TickError {
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

impl TickError {
    fn label(&self) -> &'static str {
        match self {
            TickError::Detect(_) => "detect",
            TickError::Encode(_) => "encode",
        }
    }
}

/// Per-tick processing state owned by the producer thread.
pub(crate) struct FrameProducer {
    engine: Box<dyn DetectionEngine>,
    annotator: Annotator,
    scale_factor: f64,
    format: EncodeFormat,
    quality: u8,
    frame_number: u64,
    smoothed_fps: f32,
    last_instant: Option<Instant>,
    verbose: bool,
}

impl FrameProducer {
    pub(crate) fn new(
        engine: Box<dyn DetectionEngine>,
        annotator: Annotator,
        scale_factor: f64,
        format: EncodeFormat,
        quality: u8,
    ) -> Self {
        Self {
            engine,
            annotator,
            scale_factor,
            format,
            quality,
            frame_number: 0,
            smoothed_fps: 0.0,
            last_instant: None,
            verbose: false,
        }
    }

    pub(crate) fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Number of the last frame that made it into a packet.
    pub(crate) fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Turn one captured frame into a packet ready for fan-out.
    pub(crate) fn process(&mut self, frame: Frame) -> Result<FramePacket, TickError> {
        let frame_number = self.frame_number + 1;
        let frame_span = tracing::info_span!(
            "frame",
            frame = frame_number,
            width = frame.width,
            height = frame.height,
            timestamp = frame.timestamp_ms
        );
        let _frame_guard = frame_span.enter();

        let stage_start = Instant::now();
        let detections = self.engine.detect(&frame, self.scale_factor)?;
        record_stage("detect", stage_start);

        let stage_start = Instant::now();
        let overlays = self.annotator.overlays(&frame, &detections);
        let timestamp_ms = frame.timestamp_ms;
        let annotated = self.annotator.render(frame, &overlays);
        record_stage("annotate", stage_start);

        let stage_start = Instant::now();
        let image = encode_frame(&annotated, self.format, self.quality)?;
        record_stage("encode", stage_start);

        if self.verbose {
            if overlays.is_empty() {
                debug!("frame #{frame_number}: no detections");
            } else {
                for (idx, overlay) in overlays.iter().enumerate() {
                    debug!("  #{idx}: {} bbox={:?}", overlay.text(), overlay.bbox);
                }
            }
        }

        self.frame_number = frame_number;
        self.update_fps();

        Ok(FramePacket {
            image,
            content_type: self.format.content_type(),
            detections: overlays.iter().map(|overlay| overlay.summary()).collect(),
            timestamp_ms,
            frame_number,
            fps: self.smoothed_fps,
        })
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_instant.replace(now) {
            let elapsed = now.duration_since(last).as_secs_f32();
            if elapsed > 0.0 {
                let instant = 1.0 / elapsed;
                self.smoothed_fps = if self.smoothed_fps == 0.0 {
                    instant
                } else {
                    0.9 * self.smoothed_fps + 0.1 * instant
                };
            }
        }
        metrics::gauge!("pipeline_fps").set(self.smoothed_fps as f64);
    }

    /// Forget the frame interval so a reopened device does not report the
    /// outage as a slow frame.
    fn reset_clock(&mut self) {
        self.last_instant = None;
    }
}

fn record_stage(stage: &'static str, start: Instant) {
    metrics::histogram!("stage_latency_ms", "stage" => stage)
        .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Run the capture loop until `shutdown` is set, reopening the device after
/// every capture failure. Closes the hub on exit and returns the number of
/// the last published frame.
pub(crate) fn run_producer<F>(
    mut open: F,
    mut producer: FrameProducer,
    hub: FrameHub,
    shutdown: Arc<AtomicBool>,
    backoff: Duration,
) -> u64
where
    F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError>,
{
    let mut attempt: u32 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        let mut source = match open() {
            Ok(source) => source,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                warn!("Failed to open capture device (attempt #{attempt}): {err}");
                metrics::counter!("capture_failures_total", "stage" => "open").increment(1);
                hub.interrupt();
                sleep_unless_shutdown(backoff, &shutdown);
                continue;
            }
        };
        if attempt > 0 {
            info!(source = source.describe(), attempt, "capture device reopened");
        } else {
            info!(source = source.describe(), "capture started");
        }
        attempt = 0;
        producer.reset_clock();

        while !shutdown.load(Ordering::Relaxed) {
            let frame = match tracing::info_span!("capture.read").in_scope(|| source.read()) {
                Ok(frame) => frame,
                Err(err) => {
                    error!("Capture error on {}: {err}", source.describe());
                    metrics::counter!("capture_failures_total", "stage" => "read").increment(1);
                    hub.interrupt();
                    attempt = 1;
                    break;
                }
            };

            match producer.process(frame) {
                Ok(packet) => {
                    let frame_number = packet.frame_number;
                    hub.publish(packet);
                    metrics::counter!("frames_published_total").increment(1);
                    if frame_number % 30 == 0 {
                        debug!(
                            "Producer heartbeat: frame #{frame_number}, {:.1} fps, {} viewer(s)",
                            producer.smoothed_fps,
                            hub.viewers()
                        );
                    }
                }
                Err(err) => {
                    warn!("Skipping frame: {err}");
                    metrics::counter!("frames_skipped_total", "reason" => err.label()).increment(1);
                }
            }
        }

        // Release the device before waiting so the reopen starts clean.
        drop(source);
        if attempt > 0 {
            sleep_unless_shutdown(backoff, &shutdown);
        }
    }

    hub.close();
    info!(frames = producer.frame_number(), "producer stopped");
    producer.frame_number()
}

/// Spawn [`run_producer`] on its own thread.
pub(crate) fn spawn_producer<F>(
    open: F,
    producer: FrameProducer,
    hub: FrameHub,
    shutdown: Arc<AtomicBool>,
    backoff: Duration,
) -> io::Result<JoinHandle<u64>>
where
    F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError> + Send + 'static,
{
    spawn_thread("frame-producer", move || {
        run_producer(open, producer, hub, shutdown, backoff)
    })
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}
