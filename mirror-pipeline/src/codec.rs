use bytes::Bytes;

use crate::{access_unit::BufferFlags, error::PipelineResult, format::MediaFormat};

/// Runtime parameter pushed to a started encoder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CodecParameter {
    VideoBitrate(u32),
    /// Surface-fed encoders discard incoming frames while set.
    DropInputFrames(bool),
}

/// Raw data submitted into an encoder input slot.
#[derive(Debug, Clone)]
pub struct CodecInput {
    pub data: Bytes,
    pub time_us: i64,
    pub flags: BufferFlags,
}

impl CodecInput {
    pub fn eos() -> Self {
        Self {
            data: Bytes::new(),
            time_us: 0,
            flags: BufferFlags::EOS,
        }
    }
}

/// Completed encoder output.
#[derive(Debug, Clone)]
pub struct CodecOutputBuffer {
    pub index: usize,
    pub data: Bytes,
    pub time_us: i64,
    pub flags: BufferFlags,
    /// Backed by protected memory; the slot must stay with the transport
    /// until it acknowledges the buffer.
    pub zero_copy: bool,
}

#[derive(Debug)]
pub enum DequeueOutput {
    Buffer(CodecOutputBuffer),
    FormatChanged,
    BuffersChanged,
    TryAgain,
}

/// Hardware or software encoder driven by a converter.
///
/// Calls happen on the converter's codec worker only. Input slots are owned
/// by the encoder between `queue_input_buffer` and the next time the same
/// index comes back from `dequeue_input_buffer`.
pub trait MediaCodec: Send {
    fn name(&self) -> &str;

    fn configure(&mut self, format: &MediaFormat) -> PipelineResult<()>;

    fn start(&mut self) -> PipelineResult<()>;

    fn input_buffer_count(&self) -> usize;

    fn output_buffer_count(&self) -> usize;

    /// Next free input slot, if any.
    fn dequeue_input_buffer(&mut self) -> Option<usize>;

    fn queue_input_buffer(&mut self, index: usize, input: CodecInput) -> PipelineResult<()>;

    fn dequeue_output_buffer(&mut self) -> PipelineResult<DequeueOutput>;

    fn release_output_buffer(&mut self, index: usize) -> PipelineResult<()>;

    fn request_idr_frame(&mut self) -> PipelineResult<()>;

    fn set_parameter(&mut self, parameter: CodecParameter) -> PipelineResult<()>;

    fn release(&mut self);
}
