use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use mirror_pipeline::{
    BufferFlags, CodecInput, CodecOutputBuffer, CodecParameter, DequeueOutput, MediaCodec,
    MediaFormat, PipelineError, PipelineResult,
};

const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 8;
const START_CODE: [u8; 4] = [0, 0, 0, 1];
/// Baseline SPS and PPS for the payload-only stream.
const PARAMETER_SETS: [u8; 16] = [
    0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80,
];
const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;
const DEFAULT_KEY_INTERVAL: u64 = 30;

/// Stand-in encoder for builds without FFmpeg.
///
/// Video input is wrapped unchanged into one H.264 NAL unit per frame, with
/// key frames on the configured interval and on request. Audio passes
/// through as is.
pub struct LoopbackCodec {
    format: Option<MediaFormat>,
    started: bool,
    free_inputs: VecDeque<usize>,
    outputs: VecDeque<DequeueOutput>,
    next_output: usize,
    frames: u64,
    key_interval: u64,
    force_idr: bool,
    drop_input: bool,
    bitrate: Option<u32>,
}

impl LoopbackCodec {
    pub fn new() -> Self {
        Self {
            format: None,
            started: false,
            free_inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            next_output: 0,
            frames: 0,
            key_interval: DEFAULT_KEY_INTERVAL,
            force_idr: false,
            drop_input: false,
            bitrate: None,
        }
    }

    fn is_video(&self) -> bool {
        self.format.as_ref().is_some_and(|f| f.is_video())
    }

    fn prepends_parameter_sets(&self) -> bool {
        self.format.as_ref().is_some_and(|f| f.prepend_sps_pps_to_idr)
    }

    fn push_output(&mut self, data: Bytes, time_us: i64, flags: BufferFlags) {
        let index = self.next_output % OUTPUT_SLOTS;
        self.next_output += 1;
        self.outputs.push_back(DequeueOutput::Buffer(CodecOutputBuffer {
            index,
            data,
            time_us,
            flags,
            zero_copy: false,
        }));
    }

    fn wrap_frame(&mut self, input: &CodecInput) -> (Bytes, BufferFlags) {
        let key = self.force_idr || self.frames % self.key_interval == 0;
        self.force_idr = false;
        self.frames += 1;

        let mut out = BytesMut::with_capacity(PARAMETER_SETS.len() + 5 + input.data.len());
        if key && self.prepends_parameter_sets() {
            out.extend_from_slice(&PARAMETER_SETS);
        }
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&[if key { NAL_IDR } else { NAL_NON_IDR }]);
        out.extend_from_slice(&input.data);

        let flags = if key {
            BufferFlags::KEY_FRAME
        } else {
            BufferFlags::NONE
        };
        (out.freeze(), flags)
    }
}

impl Default for LoopbackCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaCodec for LoopbackCodec {
    fn name(&self) -> &str {
        "loopback"
    }

    fn configure(&mut self, format: &MediaFormat) -> PipelineResult<()> {
        if format.is_video() && !format.is_avc() {
            return Err(PipelineError::EncoderUnsupported(format.mime.clone()));
        }
        let frame_rate = format.frame_rate.unwrap_or(30).max(1) as u64;
        self.key_interval = format
            .i_frame_interval
            .map(|secs| (secs as u64 * frame_rate).max(1))
            .unwrap_or(DEFAULT_KEY_INTERVAL);
        self.bitrate = format.bitrate;
        self.format = Some(format.clone());
        Ok(())
    }

    fn start(&mut self) -> PipelineResult<()> {
        if self.format.is_none() {
            return Err(PipelineError::EncoderConfig("start before configure".to_string()));
        }
        self.started = true;
        self.frames = 0;
        self.free_inputs = (0..INPUT_SLOTS).collect();
        if self.is_video() && !self.prepends_parameter_sets() {
            self.push_output(Bytes::from_static(&PARAMETER_SETS), 0, BufferFlags::CODEC_CONFIG);
        }
        Ok(())
    }

    fn input_buffer_count(&self) -> usize {
        INPUT_SLOTS
    }

    fn output_buffer_count(&self) -> usize {
        OUTPUT_SLOTS
    }

    fn dequeue_input_buffer(&mut self) -> Option<usize> {
        self.free_inputs.pop_front()
    }

    fn queue_input_buffer(&mut self, index: usize, input: CodecInput) -> PipelineResult<()> {
        if !self.started {
            return Err(PipelineError::Codec("loopback codec is not started".to_string()));
        }
        self.free_inputs.push_back(index);

        if input.flags.contains(BufferFlags::EOS) {
            self.push_output(Bytes::new(), input.time_us, BufferFlags::EOS);
            return Ok(());
        }
        if self.drop_input {
            return Ok(());
        }
        if self.is_video() {
            let (data, flags) = self.wrap_frame(&input);
            self.push_output(data, input.time_us, flags);
        } else {
            self.push_output(input.data, input.time_us, input.flags);
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self) -> PipelineResult<DequeueOutput> {
        Ok(self.outputs.pop_front().unwrap_or(DequeueOutput::TryAgain))
    }

    fn release_output_buffer(&mut self, _index: usize) -> PipelineResult<()> {
        Ok(())
    }

    fn request_idr_frame(&mut self) -> PipelineResult<()> {
        self.force_idr = true;
        Ok(())
    }

    fn set_parameter(&mut self, parameter: CodecParameter) -> PipelineResult<()> {
        match parameter {
            CodecParameter::VideoBitrate(bitrate) => {
                log::debug!("loopback bitrate {:?} -> {}", self.bitrate, bitrate);
                self.bitrate = Some(bitrate);
            }
            CodecParameter::DropInputFrames(drop) => self.drop_input = drop,
        }
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.outputs.clear();
        self.free_inputs.clear();
    }
}
