use thiserror::Error;

/// Errors surfaced by the mirroring pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Requested codec/profile cannot be instantiated.
    #[error("encoder unsupported: {0}")]
    EncoderUnsupported(String),

    /// Encoder rejected the negotiated format.
    #[error("encoder configuration failed: {0}")]
    EncoderConfig(String),

    /// Encoder failed while running.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport could not bind to the client endpoint.
    #[error("transport init failed: {0}")]
    TransportInit(String),

    /// Transport failed after establishment.
    #[error("transport error: {0}")]
    Transport(String),

    /// Media source refused to start.
    #[error("source start failed: {0}")]
    Start(String),

    /// Media source failed while reading.
    #[error("source error: {0}")]
    Source(String),

    #[error("network stall, {bytes_queued} bytes queued")]
    TransportStall { bytes_queued: usize },

    #[error("frame skipped: {0}")]
    TransientSkip(String),

    #[error("session is dead")]
    SessionDead,

    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The actor behind a handle has exited.
    #[error("{0} actor is gone")]
    ActorGone(&'static str),

    #[error("config error: {0}")]
    Config(String),
}

/// Coarse error classes used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Encoder or transport failed to configure; fatal to the track or session.
    Initialization,
    /// Silently dropped frame.
    TransientSkip,
    /// Recoverable back-pressure from the transport.
    TransportStall,
    /// Unrecoverable failure after establishment.
    SessionDeath,
    /// Misuse of the API.
    Usage,
}

impl PipelineError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::EncoderUnsupported(_)
            | PipelineError::EncoderConfig(_)
            | PipelineError::TransportInit(_)
            | PipelineError::Start(_)
            | PipelineError::Config(_) => ErrorCategory::Initialization,
            PipelineError::TransientSkip(_) => ErrorCategory::TransientSkip,
            PipelineError::TransportStall { .. } => ErrorCategory::TransportStall,
            PipelineError::Codec(_)
            | PipelineError::Transport(_)
            | PipelineError::Source(_)
            | PipelineError::SessionDead => ErrorCategory::SessionDeath,
            PipelineError::InvalidState { .. } | PipelineError::ActorGone(_) => {
                ErrorCategory::Usage
            }
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientSkip | ErrorCategory::TransportStall
        )
    }

    pub fn invalid_state(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        PipelineError::InvalidState {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
