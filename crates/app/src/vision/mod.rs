//! Live detection streamer: one producer captures, detects, annotates and
//! encodes frames, and every HTTP viewer receives them as a multipart stream.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `pipeline`: Startup order, producer/server wiring and shutdown.
//! - `processing`: The producer loop and its capture supervisor.
//! - `annotation`: Detection boxes, labels and the timestamp overlay.
//! - `encoding`: JPEG/PNG compression of annotated frames.
//! - `hub`: Latest-frame fan-out to viewers.
//! - `session`: Per-viewer multipart stream state machine.
//! - `server`: Actix Web endpoints.
//! - `data`: Shared structs passed between stages.

/// Re-export settings so callers can configure runs without reaching into
/// submodules.
pub use config::{StreamCliArgs, StreamConfig};
/// Launch the streamer with a ready-made configuration.
pub use pipeline::run;

mod annotation;
mod config;
mod data;
mod encoding;
mod hub;
mod pipeline;
mod processing;
mod server;
mod session;
mod telemetry;
#[cfg(test)]
mod testing;
