//! Process lifecycle: storage directory, model load, server bind, producer,
//! and orderly shutdown on Ctrl+C.
//!
//! Everything fatal happens before the first viewer can connect: a missing
//! model or a taken port ends the process with a diagnostic instead of
//! serving an empty stream.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use anyhow::{Context, Result, anyhow};
use ml_core::DetectionEngine;
use tracing::{error, info, warn};
use video_ingest::{CaptureError, FrameSource};

use crate::vision::{
    StreamConfig,
    annotation::Annotator,
    hub::FrameHub,
    processing::{CAPTURE_BACKOFF, FrameProducer, spawn_producer},
    server::{ServerOptions, ServerState, StreamServer, spawn_stream_server},
    session::SessionRegistry,
    telemetry,
};

/// Run the streamer until Ctrl+C.
pub fn run(config: StreamConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(config.verbose);
    let _ = telemetry::init_metrics_recorder();

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let pipeline_span = tracing::info_span!(
        "vision.pipeline",
        device = %config.capture.device,
        dedicated = config.capture.dedicated_camera,
        width = config.capture.width,
        height = config.capture.height,
        port = config.port,
    );
    let _pipeline_guard = pipeline_span.enter();

    let pipeline = match start(&config, shutdown) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error!("Startup failed: {err:#}");
            return Err(err);
        }
    };
    for addr in pipeline.local_addrs() {
        info!("Streaming at http://{addr}/stream.mjpg (press Ctrl+C to stop)");
    }
    pipeline.wait()
}

/// Create the storage directory, load the model and start serving the
/// configured capture device.
pub(crate) fn start(config: &StreamConfig, shutdown: Arc<AtomicBool>) -> Result<RunningPipeline> {
    std::fs::create_dir_all(&config.storage_dir).with_context(|| {
        format!(
            "Failed to create storage directory {}",
            config.storage_dir.display()
        )
    })?;

    let engine = ml_core::load_engine(&config.model).with_context(|| {
        format!(
            "Failed to load detection model {}",
            config.model.weights.display()
        )
    })?;
    info!(
        engine = engine.name(),
        input = ?engine.input_size(),
        "detection model loaded"
    );

    let capture = config.capture.clone();
    start_with(config, engine, move || video_ingest::open(&capture), shutdown)
}

/// Start the server and the producer around an already loaded engine.
pub(crate) fn start_with<F>(
    config: &StreamConfig,
    engine: Box<dyn DetectionEngine>,
    open: F,
    shutdown: Arc<AtomicBool>,
) -> Result<RunningPipeline>
where
    F: FnMut() -> Result<Box<dyn FrameSource>, CaptureError> + Send + 'static,
{
    let hub = FrameHub::new();
    let state = ServerState {
        hub: hub.clone(),
        sessions: Arc::new(SessionRegistry::default()),
    };
    let options = ServerOptions {
        host: config.bind_host.clone(),
        port: config.port,
        workers: config.http_workers,
    };
    let server = spawn_stream_server(&options, state, shutdown.clone())
        .context("Failed to start stream server")?;

    let producer = FrameProducer::new(
        engine,
        Annotator::new(config.confidence_threshold, config.labels.clone()),
        config.scale_factor,
        config.encode_format,
        config.jpeg_quality,
    )
    .verbose(config.verbose);

    let handle = match spawn_producer(open, producer, hub.clone(), shutdown.clone(), CAPTURE_BACKOFF)
    {
        Ok(handle) => handle,
        Err(err) => {
            server.stop();
            return Err(err).context("Failed to spawn producer thread");
        }
    };

    Ok(RunningPipeline {
        server,
        producer: handle,
        hub,
        shutdown,
    })
}

/// Handles of a started streamer.
pub(crate) struct RunningPipeline {
    server: StreamServer,
    producer: JoinHandle<u64>,
    hub: FrameHub,
    shutdown: Arc<AtomicBool>,
}

impl RunningPipeline {
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        self.server.local_addrs()
    }

    #[cfg(test)]
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Block until the producer exits, then stop the server.
    ///
    /// A server thread that ends on its own raises the shutdown flag, so the
    /// producer stops too and this returns an error.
    pub(crate) fn wait(self) -> Result<()> {
        let outcome = self.producer.join();
        let server_exited = self.server.exited();
        // A panicking producer never closed the hub; do it so viewers leave.
        self.hub.close();
        self.server.stop();
        match outcome {
            Err(_) => Err(anyhow!("frame producer panicked")),
            Ok(frames) if server_exited => {
                error!(frames, "Stream server exited; producer stopped");
                Err(anyhow!("stream server exited unexpectedly"))
            }
            Ok(frames) => {
                info!(frames, "Streamer stopped");
                Ok(())
            }
        }
    }
}
