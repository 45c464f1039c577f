//! Configuration parsing for the streamer.
//!
//! This module owns translation of CLI arguments (and their environment
//! fallbacks) into a validated `StreamConfig` that the pipeline uses without
//! re-parsing flags.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use clap::Args;
use ml_core::{
    ClassLabelTable, ModelSpec,
    ssd::{DEFAULT_INPUT_SIZE, DEFAULT_MEAN, DEFAULT_SCALE_FACTOR},
};
use video_ingest::CaptureConfig;

use crate::vision::encoding::EncodeFormat;

const DEFAULT_PROTOTXT: &str = "./models/deploy_mobile_net_ssd.prototxt.txt";
const DEFAULT_WEIGHTS: &str = "./models/deploy_mobile_net_ssd.caffemodel";
const DEFAULT_CONFIDENCE: f32 = 0.2;
const DEFAULT_JPEG_QUALITY: u8 = 95;
const DEFAULT_PORT: u16 = 8080;

#[derive(Clone, Debug)]
/// Canonical configuration shared by every stage of the streamer.
pub struct StreamConfig {
    /// Capture device settings handed to `video_ingest::open`.
    pub capture: CaptureConfig,
    /// Detection model files and preprocessing.
    pub model: ModelSpec,
    /// Multiplier applied to pixel values after mean subtraction.
    pub scale_factor: f64,
    /// Minimum confidence for a detection to be drawn.
    pub confidence_threshold: f32,
    pub labels: ClassLabelTable,
    pub encode_format: EncodeFormat,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    pub bind_host: String,
    pub port: u16,
    /// Actix worker threads; `None` uses one per core.
    pub http_workers: Option<usize>,
    /// Created on startup before the model is loaded.
    pub storage_dir: PathBuf,
    pub verbose: bool,
}

/// CLI arguments of the streamer.
#[derive(Debug, Args)]
pub struct StreamCliArgs {
    /// Capture device index, `/dev/videoN` node or URI.
    #[arg(long, env = "DETECT_STREAM_DEVICE", value_name = "DEVICE")]
    pub device: Option<String>,
    /// Capture the board camera through ffmpeg/video4linux2 instead of OpenCV.
    #[arg(long = "dedicated-camera", env = "DETECT_STREAM_DEDICATED_CAMERA", action = clap::ArgAction::SetTrue)]
    pub dedicated_camera: bool,
    /// Capture width in pixels.
    #[arg(long, env = "DETECT_STREAM_WIDTH", value_name = "PX")]
    pub width: Option<i32>,
    /// Capture height in pixels.
    #[arg(long, env = "DETECT_STREAM_HEIGHT", value_name = "PX")]
    pub height: Option<i32>,
    /// Requested capture frame rate.
    #[arg(long, env = "DETECT_STREAM_FPS", value_name = "FPS")]
    pub fps: Option<f64>,
    /// Pause before the first frame is read.
    #[arg(long = "warmup-ms", env = "DETECT_STREAM_WARMUP_MS", value_name = "MS")]
    pub warmup_ms: Option<u64>,
    /// Treat a device that stays silent this long as failed.
    #[arg(long = "read-timeout-ms", env = "DETECT_STREAM_READ_TIMEOUT_MS", value_name = "MS")]
    pub read_timeout_ms: Option<u64>,
    /// Address to listen on.
    #[arg(long, env = "DETECT_STREAM_BIND", value_name = "HOST")]
    pub bind: Option<String>,
    /// HTTP port.
    #[arg(long, env = "DETECT_STREAM_PORT", value_name = "PORT")]
    pub port: Option<u16>,
    /// Minimum detection confidence drawn on frames (0-1).
    #[arg(long, env = "DETECT_STREAM_CONFIDENCE", value_name = "SCORE")]
    pub confidence: Option<f32>,
    /// JSON object mapping class ids to names; defaults to the 21 VOC classes.
    #[arg(long, env = "DETECT_STREAM_LABELS", value_name = "PATH")]
    pub labels: Option<PathBuf>,
    /// Caffe network definition.
    #[arg(long, env = "DETECT_STREAM_PROTOTXT", value_name = "PATH")]
    pub prototxt: Option<PathBuf>,
    /// Caffe weights.
    #[arg(long, env = "DETECT_STREAM_WEIGHTS", value_name = "PATH")]
    pub weights: Option<PathBuf>,
    /// Model input width in pixels.
    #[arg(long = "input-width", value_name = "PX")]
    pub input_width: Option<i32>,
    /// Model input height in pixels.
    #[arg(long = "input-height", value_name = "PX")]
    pub input_height: Option<i32>,
    /// Per-channel mean subtracted before inference: one value or `r,g,b`.
    #[arg(long, value_name = "MEAN", value_delimiter = ',')]
    pub mean: Vec<f64>,
    /// Swap red and blue before inference.
    #[arg(long = "swap-rb", action = clap::ArgAction::SetTrue)]
    pub swap_rb: bool,
    /// Pixel scale factor applied after mean subtraction.
    #[arg(long = "scale-factor", value_name = "FACTOR")]
    pub scale_factor: Option<f64>,
    /// Image format pushed to viewers.
    #[arg(long, env = "DETECT_STREAM_FORMAT", value_enum)]
    pub format: Option<EncodeFormat>,
    /// JPEG quality used by the encoder (1-100).
    #[arg(long = "jpeg-quality", env = "DETECT_STREAM_JPEG_QUALITY", value_name = "QUALITY")]
    pub jpeg_quality: Option<i32>,
    /// Directory created on startup for stored detections.
    #[arg(long = "storage-dir", env = "DETECT_STREAM_STORAGE_DIR", value_name = "PATH")]
    pub storage_dir: Option<PathBuf>,
    /// HTTP worker threads.
    #[arg(long = "http-workers", env = "DETECT_STREAM_HTTP_WORKERS", value_name = "N")]
    pub http_workers: Option<usize>,
    /// Enable verbose logging (per-frame detections, session events).
    #[arg(long = "verbose", action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<StreamCliArgs> for StreamConfig {
    type Error = anyhow::Error;

    fn try_from(args: StreamCliArgs) -> Result<Self> {
        let width = args.width.unwrap_or(640);
        let height = args.height.unwrap_or(480);
        if width <= 0 || height <= 0 {
            bail!("Capture width and height must be positive integers");
        }

        let frame_rate = args.fps.unwrap_or(30.0);
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            bail!("--fps must be a positive number");
        }

        let read_timeout = match args.read_timeout_ms {
            Some(0) => bail!("--read-timeout-ms must be at least 1"),
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        };

        let capture = CaptureConfig {
            device: args.device.unwrap_or_else(|| "0".to_string()),
            dedicated_camera: args.dedicated_camera,
            width,
            height,
            frame_rate,
            warmup: Duration::from_millis(args.warmup_ms.unwrap_or(2000)),
            read_timeout,
        };

        let confidence_threshold = args.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        if !(0.0..=1.0).contains(&confidence_threshold) {
            bail!("--confidence must be between 0 and 1");
        }

        let (input_width, input_height) = match (args.input_width, args.input_height) {
            (None, None) => DEFAULT_INPUT_SIZE,
            (Some(w), None) => (w, w),
            (None, Some(h)) => (h, h),
            (Some(w), Some(h)) => (w, h),
        };
        if input_width <= 0 || input_height <= 0 {
            bail!("Model input dimensions must be positive integers");
        }

        let mean = match args.mean.as_slice() {
            [] => DEFAULT_MEAN,
            [value] => [*value; 3],
            [r, g, b] => [*r, *g, *b],
            other => bail!("--mean takes one value or three (r,g,b), got {}", other.len()),
        };

        let scale_factor = args.scale_factor.unwrap_or(DEFAULT_SCALE_FACTOR);
        if !(scale_factor.is_finite() && scale_factor > 0.0) {
            bail!("--scale-factor must be a positive number");
        }

        let mut model = ModelSpec::new(
            args.prototxt.unwrap_or_else(|| PathBuf::from(DEFAULT_PROTOTXT)),
            args.weights.unwrap_or_else(|| PathBuf::from(DEFAULT_WEIGHTS)),
        );
        model.input_size = (input_width, input_height);
        model.mean = mean;
        model.swap_rb = args.swap_rb;

        let labels = match args.labels {
            Some(path) => ClassLabelTable::from_path(&path)
                .with_context(|| format!("Failed to load class labels from {}", path.display()))?,
            None => ClassLabelTable::voc(),
        };

        let jpeg_quality = args.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY as i32);
        if !(1..=100).contains(&jpeg_quality) {
            bail!("--jpeg-quality must be an integer between 1 and 100");
        }

        let http_workers = match args.http_workers {
            Some(0) => bail!("--http-workers must be at least 1"),
            other => other,
        };

        Ok(Self {
            capture,
            model,
            scale_factor,
            confidence_threshold,
            labels,
            encode_format: args.format.unwrap_or_default(),
            jpeg_quality: jpeg_quality as u8,
            bind_host: args.bind.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: args.port.unwrap_or(DEFAULT_PORT),
            http_workers,
            storage_dir: args.storage_dir.unwrap_or_else(|| PathBuf::from("./storage")),
            verbose: args.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;
    use crate::cli::Cli;

    fn parse(argv: &[&str]) -> Result<StreamConfig> {
        let cli = Cli::try_parse_from(std::iter::once("detect-stream").chain(argv.iter().copied()))?;
        StreamConfig::try_from(cli.stream)
    }

    #[test]
    fn defaults_match_the_reference_deployment() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.capture.device, "0");
        assert!(!config.capture.dedicated_camera);
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.frame_rate, 30.0);
        assert_eq!(config.capture.warmup, Duration::from_secs(2));
        assert_eq!(config.capture.read_timeout, None);
        assert_eq!(config.port, 8080);
        assert_eq!(config.confidence_threshold, 0.2);
        assert_eq!(config.scale_factor, 0.007843);
        assert_eq!(config.model.input_size, (300, 300));
        assert_eq!(config.model.mean, [127.5; 3]);
        assert_eq!(config.labels.get(15), Some("person"));
        assert_eq!(config.encode_format, EncodeFormat::Jpeg);
        assert_eq!(config.jpeg_quality, 95);
        assert_eq!(config.storage_dir, PathBuf::from("./storage"));
    }

    #[test]
    fn flags_override_defaults() {
        let config = parse(&[
            "--device",
            "/dev/video2",
            "--dedicated-camera",
            "--width",
            "320",
            "--height",
            "240",
            "--read-timeout-ms",
            "1500",
            "--port",
            "9000",
            "--mean",
            "104,117,123",
            "--input-width",
            "512",
            "--format",
            "png",
        ])
        .unwrap();
        assert_eq!(config.capture.device, "/dev/video2");
        assert!(config.capture.dedicated_camera);
        assert_eq!((config.capture.width, config.capture.height), (320, 240));
        assert_eq!(config.capture.read_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.port, 9000);
        assert_eq!(config.model.mean, [104.0, 117.0, 123.0]);
        assert_eq!(config.model.input_size, (512, 512));
        assert_eq!(config.encode_format, EncodeFormat::Png);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(parse(&["--width", "0"]).is_err());
        assert!(parse(&["--confidence", "1.5"]).is_err());
        assert!(parse(&["--jpeg-quality", "0"]).is_err());
        assert!(parse(&["--mean", "1,2"]).is_err());
        assert!(parse(&["--fps", "-5"]).is_err());
        assert!(parse(&["--http-workers", "0"]).is_err());
        assert!(parse(&["--read-timeout-ms", "0"]).is_err());
    }

    #[test]
    fn labels_are_loaded_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"1": "forklift", "2": "pallet"}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = parse(&["--labels", &path]).unwrap();
        assert_eq!(config.labels.get(1), Some("forklift"));
        assert_eq!(config.labels.get(7), None);

        let err = parse(&["--labels", "/nonexistent/labels.json"]).unwrap_err();
        assert!(format!("{err:#}").contains("class labels"));
    }
}
