use std::{collections::VecDeque, path::Path};

use bytes::{Bytes, BytesMut};
use ffmpeg_next::{Rational, codec::Id, format::context::Input, media};

use crate::{
    access_unit::{AccessUnit, BufferFlags},
    annexb,
    error::{PipelineError, PipelineResult},
    extractor::SampleExtractor,
    format::{MIME_AUDIO_AAC, MIME_AUDIO_RAW, MIME_VIDEO_AVC, MediaFormat},
};

struct FileTrack {
    format: MediaFormat,
    time_base: Rational,
    // SPS/PPS as Annex B, prepended to key frames
    parameter_sets: Option<Bytes>,
    // length-prefixed NAL units, as stored in MP4
    avcc: bool,
    selected: bool,
}

/// Demuxer for local files on libavformat.
///
/// H.264 samples come out as Annex B with parameter sets in front of every
/// key frame, the layout a live encoder produces.
pub struct FfmpegExtractor {
    input: Input,
    tracks: Vec<FileTrack>,
    // packets read ahead of the current sample
    backlog: VecDeque<ffmpeg_next::codec::packet::Packet>,
    eof: bool,
}

impl FfmpegExtractor {
    pub fn open(path: &Path) -> PipelineResult<Self> {
        let input = ffmpeg_next::format::input(path)
            .map_err(|e| PipelineError::Source(format!("open {}: {}", path.display(), e)))?;

        let tracks = input.streams().map(|stream| file_track(&stream)).collect::<Vec<_>>();
        for (index, track) in tracks.iter().enumerate() {
            log::info!("{}: track {}: {}", path.display(), index, track.format);
        }

        Ok(Self {
            input,
            tracks,
            backlog: VecDeque::new(),
            eof: false,
        })
    }

    fn is_selected(&self, packet: &ffmpeg_next::codec::packet::Packet) -> bool {
        self.tracks.get(packet.stream()).is_some_and(|t| t.selected)
    }

    fn current(&self) -> Option<&ffmpeg_next::codec::packet::Packet> {
        self.backlog.iter().find(|p| self.is_selected(p))
    }

    /// Reads until a selected sample is buffered or the file ends.
    fn fill(&mut self) {
        while !self.eof && self.current().is_none() {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => self.backlog.push_back(packet),
                Err(ffmpeg_next::Error::Eof) => self.eof = true,
                Err(e) => {
                    log::warn!("read packet error: {}, treating as end of file", e);
                    self.eof = true;
                }
            }
        }
    }
}

impl SampleExtractor for FfmpegExtractor {
    fn track_formats(&self) -> Vec<MediaFormat> {
        self.tracks.iter().map(|t| t.format.clone()).collect()
    }

    fn select_track(&mut self, index: usize) -> PipelineResult<()> {
        let track = self
            .tracks
            .get_mut(index)
            .ok_or_else(|| PipelineError::Source(format!("no track {}", index)))?;
        track.selected = true;
        self.fill();
        Ok(())
    }

    fn sample_time_us(&self) -> Option<i64> {
        let packet = self.current()?;
        let track = &self.tracks[packet.stream()];
        Some(to_us(packet.pts().or(packet.dts()).unwrap_or(0), track.time_base))
    }

    fn read_sample(&mut self) -> PipelineResult<(usize, AccessUnit)> {
        let packet = self
            .current()
            .ok_or_else(|| PipelineError::Source("end of file".to_string()))?;
        let index = packet.stream();
        let track = &self.tracks[index];
        let raw = packet.data().unwrap_or_default();
        let time_us = to_us(packet.pts().or(packet.dts()).unwrap_or(0), track.time_base);

        let mut flags = BufferFlags::NONE;
        let data = if track.format.is_avc() {
            let nals = if track.avcc {
                annexb::avcc_to_annexb(raw)
            } else {
                Bytes::copy_from_slice(raw)
            };
            match (packet.is_key(), track.parameter_sets.as_ref()) {
                (true, Some(csd)) => {
                    flags = BufferFlags::KEY_FRAME;
                    let mut out = BytesMut::with_capacity(csd.len() + nals.len());
                    out.extend_from_slice(csd);
                    out.extend_from_slice(&nals);
                    out.freeze()
                }
                (true, None) => {
                    flags = BufferFlags::KEY_FRAME;
                    nals
                }
                _ => nals,
            }
        } else {
            Bytes::copy_from_slice(raw)
        };

        Ok((index, AccessUnit::new(data, time_us).with_flags(flags)))
    }

    fn advance(&mut self) -> bool {
        // drop everything up to and including the current sample
        while let Some(packet) = self.backlog.pop_front() {
            if self.is_selected(&packet) {
                break;
            }
        }
        self.fill();
        self.current().is_some()
    }
}

fn file_track(stream: &ffmpeg_next::format::stream::Stream) -> FileTrack {
    let parameters = stream.parameters();
    let id = parameters.id();
    let (width, height, sample_rate, channels, extradata) = unsafe {
        let par = parameters.as_ptr();
        let extradata = if (*par).extradata.is_null() || (*par).extradata_size <= 0 {
            Vec::new()
        } else {
            std::slice::from_raw_parts((*par).extradata, (*par).extradata_size as usize).to_vec()
        };
        (
            (*par).width,
            (*par).height,
            (*par).sample_rate,
            (*par).ch_layout.nb_channels,
            extradata,
        )
    };

    let format = match (parameters.medium(), id) {
        (media::Type::Video, Id::H264) => MediaFormat::video(width.max(0) as u32, height.max(0) as u32),
        (media::Type::Audio, Id::AAC) => {
            MediaFormat::audio(MIME_AUDIO_AAC, sample_rate.max(0) as u32, channels.max(0) as u32)
        }
        (media::Type::Audio, Id::PCM_S16LE) => {
            MediaFormat::audio(MIME_AUDIO_RAW, sample_rate.max(0) as u32, channels.max(0) as u32)
        }
        (medium, id) => MediaFormat {
            mime: format!("{:?}/{:?}", medium, id).to_lowercase(),
            ..Default::default()
        },
    };

    let avcc = format.mime == MIME_VIDEO_AVC && extradata.first() == Some(&1);
    let parameter_sets = if avcc {
        annexb::avcc_parameter_sets(&extradata)
    } else if annexb::is_annexb(&extradata) {
        Some(Bytes::from(extradata))
    } else {
        None
    };

    FileTrack {
        format,
        time_base: stream.time_base(),
        parameter_sets,
        avcc,
        selected: false,
    }
}

fn to_us(ts: i64, time_base: Rational) -> i64 {
    let (num, den) = (time_base.numerator() as i128, time_base.denominator() as i128);
    if den == 0 {
        return ts;
    }
    (ts as i128 * num * 1_000_000 / den) as i64
}
