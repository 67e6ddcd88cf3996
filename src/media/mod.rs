//! Local stand-ins for the platform pieces a session is built from:
//!
//! ```text
//! TestPatternSource ──► [repeater] ──► encoder (FFmpeg | loopback) ──┐
//!                                                                    ├──► FileSender ──► track files
//! ToneSource ─────────────────────────► PCM packetizer ──────────────┘          │
//!                                                                               └──► latency feedback
//! ```

use std::path::{Path, PathBuf};

use mirror_pipeline::{
    MediaCodec, MediaFormat, MediaSender, MediaSource, PipelineError, PipelineResult,
    SampleExtractor, SessionBackend,
};

pub mod file_sender;
pub mod loopback;
pub mod source;

use file_sender::FileSender;
use loopback::LoopbackCodec;
use source::{TestPatternSource, ToneSource};

/// Frame rate the test pattern renders at, before any repeater.
const PATTERN_FRAME_RATE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Loopback,
    #[cfg(feature = "ffmpeg")]
    Ffmpeg,
}

pub struct LocalBackend {
    output_dir: PathBuf,
    encoder: EncoderKind,
}

impl LocalBackend {
    pub fn new(output_dir: impl AsRef<Path>, encoder: EncoderKind) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            encoder,
        }
    }
}

impl SessionBackend for LocalBackend {
    fn create_sender(&mut self) -> PipelineResult<Box<dyn MediaSender>> {
        Ok(Box::new(FileSender::new(&self.output_dir)))
    }

    fn create_video_source(&mut self, width: u32, height: u32) -> PipelineResult<Box<dyn MediaSource>> {
        Ok(Box::new(TestPatternSource::new(width, height, PATTERN_FRAME_RATE)))
    }

    fn create_audio_source(&mut self) -> PipelineResult<Box<dyn MediaSource>> {
        Ok(Box::new(ToneSource::new()))
    }

    fn create_encoder(&mut self, format: &MediaFormat) -> PipelineResult<Box<dyn MediaCodec>> {
        log::info!("creating {:?} encoder for {}", self.encoder, format);
        match self.encoder {
            EncoderKind::Loopback => Ok(Box::new(LoopbackCodec::new())),
            #[cfg(feature = "ffmpeg")]
            EncoderKind::Ffmpeg => {
                if format.is_avc() {
                    Ok(Box::new(mirror_pipeline::ffmpeg::FfmpegEncoder::new()))
                } else {
                    Err(PipelineError::EncoderUnsupported(format.mime.clone()))
                }
            }
        }
    }

    fn create_extractor(&mut self, path: &Path) -> PipelineResult<Box<dyn SampleExtractor>> {
        #[cfg(feature = "ffmpeg")]
        {
            Ok(Box::new(mirror_pipeline::ffmpeg::FfmpegExtractor::open(path)?))
        }
        #[cfg(not(feature = "ffmpeg"))]
        {
            Err(PipelineError::Source(format!(
                "cannot demux {} without ffmpeg support",
                path.display()
            )))
        }
    }
}
