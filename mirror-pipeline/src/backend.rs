use std::path::Path;

use crate::{
    codec::MediaCodec, error::PipelineResult, extractor::SampleExtractor, format::MediaFormat,
    puller::MediaSource, sender::MediaSender,
};

/// Creates the platform pieces a playback session is assembled from.
pub trait SessionBackend: Send {
    fn create_sender(&mut self) -> PipelineResult<Box<dyn MediaSender>>;

    /// Raw frames at the session resolution.
    fn create_video_source(&mut self, width: u32, height: u32) -> PipelineResult<Box<dyn MediaSource>>;

    /// Stereo 16 bit PCM at 48 kHz.
    fn create_audio_source(&mut self) -> PipelineResult<Box<dyn MediaSource>>;

    /// Encoder producing `format`.
    fn create_encoder(&mut self, format: &MediaFormat) -> PipelineResult<Box<dyn MediaCodec>>;

    fn create_extractor(&mut self, path: &Path) -> PipelineResult<Box<dyn SampleExtractor>>;
}
