use std::collections::VecDeque;

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Rational, format::Pixel, picture};

use super::{codec_error, hw};
use crate::{
    access_unit::BufferFlags,
    codec::{CodecInput, CodecOutputBuffer, CodecParameter, DequeueOutput, MediaCodec},
    error::{PipelineError, PipelineResult},
    format::MediaFormat,
};

const SOFTWARE_ENCODER: &str = "libx264";
const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 8;
// timestamps stay in microseconds
const TIME_BASE: Rational = Rational(1, 1_000_000);

/// H.264 encoder on libavcodec, fed with tightly packed I420 frames.
///
/// Frames are encoded synchronously in `queue_input_buffer` and the packets
/// wait in an output queue; input slots come back right away.
pub struct FfmpegEncoder {
    name: String,
    format: Option<MediaFormat>,
    encoder: Option<ffmpeg_next::codec::encoder::Video>,
    free_inputs: VecDeque<usize>,
    outputs: VecDeque<DequeueOutput>,
    next_output: usize,
    force_idr: bool,
    drop_input: bool,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegEncoder {
    pub fn new() -> Self {
        Self {
            name: SOFTWARE_ENCODER.to_string(),
            format: None,
            encoder: None,
            free_inputs: VecDeque::new(),
            outputs: VecDeque::new(),
            next_output: 0,
            force_idr: false,
            drop_input: false,
        }
    }

    fn open(
        codec: ffmpeg_next::Codec,
        format: &MediaFormat,
    ) -> Result<ffmpeg_next::codec::encoder::Video, ffmpeg_next::Error> {
        let codec_name = codec.name().to_string();
        let frame_rate = format.frame_rate.unwrap_or(30).max(1);

        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video()?;
        encoder.set_width(format.width.unwrap_or(0));
        encoder.set_height(format.height.unwrap_or(0));
        encoder.set_format(Pixel::YUV420P);
        encoder.set_frame_rate(Some(Rational(frame_rate as i32, 1)));
        encoder.set_time_base(TIME_BASE);
        encoder.set_max_b_frames(0);
        if let Some(bitrate) = format.bitrate {
            encoder.set_bit_rate(bitrate as usize);
            if format.constant_bitrate {
                encoder.set_max_bit_rate(bitrate as usize);
            }
        }
        if let Some(interval) = format.i_frame_interval {
            encoder.set_gop(interval.saturating_mul(frame_rate));
        }
        // without a global header SPS/PPS repeat in front of every IDR frame
        if !format.prepend_sps_pps_to_idr {
            encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        let mut options = Dictionary::new();
        if !hw::is_hw_encoder(&codec_name) {
            options.set("preset", "ultrafast");
            options.set("tune", "zerolatency");
            if format.intra_refresh_mbs.is_some_and(|mbs| mbs > 0) {
                options.set("intra-refresh", "1");
            }
        }
        if let Some(profile) = format.profile_idc.and_then(profile_name) {
            options.set("profile", profile);
        }
        encoder.open_with(options)
    }

    fn open_software(&mut self, format: &MediaFormat) -> PipelineResult<ffmpeg_next::codec::encoder::Video> {
        let codec = ffmpeg_next::encoder::find_by_name(SOFTWARE_ENCODER)
            .ok_or_else(|| PipelineError::EncoderUnsupported(SOFTWARE_ENCODER.to_string()))?;
        let encoder = Self::open(codec, format)
            .map_err(|e| PipelineError::EncoderConfig(format!("{}: {}", SOFTWARE_ENCODER, e)))?;
        self.name = SOFTWARE_ENCODER.to_string();
        Ok(encoder)
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

    fn drain(&mut self) -> PipelineResult<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        let mut packets = Vec::new();
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    let flags = if packet.is_key() {
                        BufferFlags::KEY_FRAME
                    } else {
                        BufferFlags::NONE
                    };
                    let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
                    packets.push((data, packet.pts().unwrap_or(0), flags));
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                    break;
                }
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => return Err(codec_error(e)),
            }
        }
        for (data, time_us, flags) in packets {
            self.push_output(data, time_us, flags);
        }
        Ok(())
    }
}

impl MediaCodec for FfmpegEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure(&mut self, format: &MediaFormat) -> PipelineResult<()> {
        if !format.is_avc() {
            return Err(PipelineError::EncoderUnsupported(format.mime.clone()));
        }
        if format.width.is_none() || format.height.is_none() {
            return Err(PipelineError::EncoderConfig(
                "video size is required".to_string(),
            ));
        }
        self.format = Some(format.clone());
        Ok(())
    }

    fn start(&mut self) -> PipelineResult<()> {
        let format = self
            .format
            .clone()
            .ok_or_else(|| PipelineError::EncoderConfig("start before configure".to_string()))?;

        // hardware first, libx264 when none works
        let encoder = match hw::find_hw_h264_encoder() {
            Some(codec) => match Self::open(codec, &format) {
                Ok(encoder) => {
                    self.name = codec.name().to_string();
                    encoder
                }
                Err(e) => {
                    log::warn!(
                        "hardware encoder {} failed: {}, falling back to {}",
                        codec.name(),
                        e,
                        SOFTWARE_ENCODER
                    );
                    self.open_software(&format)?
                }
            },
            None => {
                log::info!("no hardware encoder found, using software encoder: {}", SOFTWARE_ENCODER);
                self.open_software(&format)?
            }
        };
        log::info!("encoder opened successfully: {}", self.name);

        let extradata = unsafe {
            let ctx = encoder.as_ptr();
            let data = (*ctx).extradata;
            let size = (*ctx).extradata_size;
            if data.is_null() || size <= 0 {
                None
            } else {
                Some(Bytes::copy_from_slice(std::slice::from_raw_parts(data, size as usize)))
            }
        };
        self.encoder = Some(encoder);
        self.free_inputs = (0..INPUT_SLOTS).collect();
        if let Some(csd) = extradata {
            self.push_output(csd, 0, BufferFlags::CODEC_CONFIG);
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
        // the frame is copied, the slot is free again
        self.free_inputs.push_back(index);

        let (Some(format), Some(encoder)) = (self.format.as_ref(), self.encoder.as_mut()) else {
            return Err(PipelineError::Codec("encoder is not started".to_string()));
        };

        if input.flags.contains(BufferFlags::EOS) {
            encoder.send_eof().map_err(codec_error)?;
            self.drain()?;
            self.push_output(Bytes::new(), input.time_us, BufferFlags::EOS);
            return Ok(());
        }
        if self.drop_input {
            return Ok(());
        }

        let mut frame = i420_frame(
            &input.data,
            format.width.unwrap_or(0),
            format.height.unwrap_or(0),
            input.time_us,
        )?;
        if self.force_idr {
            frame.set_kind(picture::Type::I);
            self.force_idr = false;
        }
        encoder.send_frame(&frame).map_err(codec_error)?;
        self.drain()
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
                let encoder = self
                    .encoder
                    .as_mut()
                    .ok_or_else(|| PipelineError::Codec("encoder is not started".to_string()))?;
                // libx264 reconfigures itself when the context bitrate changes
                unsafe {
                    let ctx = encoder.as_mut_ptr();
                    (*ctx).bit_rate = bitrate as i64;
                    (*ctx).rc_max_rate = bitrate as i64;
                }
            }
            CodecParameter::DropInputFrames(drop) => self.drop_input = drop,
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.encoder.take().is_some() {
            log::info!("encoder {} released", self.name);
        }
        self.outputs.clear();
        self.free_inputs.clear();
    }
}

fn profile_name(profile_idc: u32) -> Option<&'static str> {
    match profile_idc {
        66 => Some("baseline"),
        77 => Some("main"),
        100 => Some("high"),
        _ => None,
    }
}

fn i420_frame(data: &[u8], width: u32, height: u32, time_us: i64) -> PipelineResult<ffmpeg_next::frame::Video> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let expected = w * h + 2 * cw * ch;
    if data.len() < expected {
        return Err(PipelineError::Codec(format!(
            "short I420 frame: {} of {} bytes",
            data.len(),
            expected
        )));
    }

    let mut frame = ffmpeg_next::frame::Video::new(Pixel::YUV420P, width, height);
    let mut offset = 0;
    for (plane, (pw, ph)) in [(w, h), (cw, ch), (cw, ch)].into_iter().enumerate() {
        let stride = frame.stride(plane);
        let dst = frame.data_mut(plane);
        for row in 0..ph {
            let src = &data[offset + row * pw..offset + (row + 1) * pw];
            dst[row * stride..row * stride + pw].copy_from_slice(src);
        }
        offset += pw * ph;
    }
    frame.set_pts(Some(time_us));
    Ok(frame)
}
