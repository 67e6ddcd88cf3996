//! Source side of a real-time screen mirroring link: capture sources feed
//! encoders whose access units go out through a transport, with bitrate and
//! frame rate adapted to sink feedback.

pub mod access_unit;
pub mod adaptive;
pub mod annexb;
pub mod backend;
pub mod codec;
pub mod config;
pub mod converter;
pub mod error;
pub mod extractor;
pub mod format;
pub mod message;
pub mod pcm;
pub mod puller;
pub mod repeater;
pub mod sender;
pub mod session;
pub mod track;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(test)]
pub(crate) mod mock;

pub use access_unit::{AccessUnit, BufferFlags, ReleaseHandle};
pub use backend::SessionBackend;
pub use codec::{CodecInput, CodecOutputBuffer, CodecParameter, DequeueOutput, MediaCodec};
pub use config::{AdaptiveConfig, DebugConfig, EncoderConfig, RateControl, SessionConfig};
pub use error::{ErrorCategory, PipelineError, PipelineResult};
pub use extractor::SampleExtractor;
pub use format::{MediaFormat, MediaKind};
pub use puller::{MediaSource, SourceControl};
pub use sender::{Endpoint, MediaSender, SenderEvent, TrackFlags, TransportMode};
pub use session::{InitParams, PlaybackSession, SessionEvent, SessionState, SessionStatus};
