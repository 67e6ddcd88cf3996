//! FFmpeg-backed encoder and file extractor.

mod encoder;
mod extractor;
mod hw;

pub use encoder::FfmpegEncoder;
pub use extractor::FfmpegExtractor;

use crate::error::{PipelineError, PipelineResult};

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> PipelineResult<()> {
    ffmpeg_next::init().map_err(|e| PipelineError::Config(format!("ffmpeg_next init: {}", e)))
}

fn codec_error(e: ffmpeg_next::Error) -> PipelineError {
    PipelineError::Codec(e.to_string())
}
