use clap::Parser;

use crate::vision::StreamCliArgs;

/// Live object detection served as an MJPEG stream.
#[derive(Debug, Parser)]
#[command(name = "detect-stream", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub stream: StreamCliArgs,
}
