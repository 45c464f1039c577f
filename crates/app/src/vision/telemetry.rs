//! Telemetry helpers for tracing subscribers and Prometheus metrics.

use std::{io, sync::OnceLock, thread, time::Duration};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, prelude::*};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Guard returned when a telemetry subscriber has been installed for the current thread.
pub(crate) struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
}

/// Install the Prometheus recorder once and return its handle.
///
/// A recorder installed by someone else is left in place; `/metrics` then
/// answers 503.
pub(crate) fn init_metrics_recorder() -> Option<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Some(handle);
    }
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    if let Err(err) = metrics::set_global_recorder(recorder) {
        warn!("metrics recorder not installed: {err}");
        return None;
    }
    describe_metrics();

    let upkeep_handle = handle.clone();
    PROM_UPKEEP_THREAD.get_or_init(|| {
        match spawn_thread("prometheus-upkeep", move || {
            loop {
                thread::sleep(Duration::from_secs(5));
                upkeep_handle.run_upkeep();
            }
        }) {
            Ok(join) => join,
            Err(err) => {
                warn!("failed to spawn prometheus upkeep thread: {err}");
                thread::spawn(|| {})
            }
        }
    });

    Some(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub(crate) fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

fn describe_metrics() {
    metrics::describe_counter!("frames_published_total", "Frames pushed to the fan-out hub");
    metrics::describe_counter!(
        "frames_skipped_total",
        "Ticks dropped because detection or encoding failed"
    );
    metrics::describe_counter!("capture_failures_total", "Capture errors that interrupted the feed");
    metrics::describe_histogram!("stage_latency_ms", "Per-stage processing latency in milliseconds");
    metrics::describe_gauge!("stream_sessions_active", "Viewers currently attached to the stream");
    metrics::describe_counter!("stream_sessions_closed_total", "Stream sessions closed, by reason");
}

/// Install the fmt subscriber for the current thread. `RUST_LOG` wins over
/// `verbose`.
pub(crate) fn enter_runtime(verbose: bool) -> TelemetryGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub(crate) fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}
