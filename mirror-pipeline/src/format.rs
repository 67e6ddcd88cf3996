use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_AUDIO_AAC: &str = "audio/mp4a-latm";
pub const MIME_AUDIO_RAW: &str = "audio/raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Format negotiated with an encoder or announced to the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    // bps
    pub bitrate: Option<u32>,
    pub constant_bitrate: bool,
    pub frame_rate: Option<u32>,
    // seconds between forced key frames
    pub i_frame_interval: Option<u32>,
    // cyclic intra-refresh macroblocks per frame
    pub intra_refresh_mbs: Option<u32>,
    pub profile_idc: Option<u32>,
    pub level_idc: Option<u32>,
    pub constraint_set: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    /// Ask the encoder to emit SPS/PPS in front of every IDR frame.
    pub prepend_sps_pps_to_idr: bool,
}

impl MediaFormat {
    pub fn video(width: u32, height: u32) -> Self {
        Self {
            mime: MIME_VIDEO_AVC.to_string(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> MediaKind {
        if self.is_video() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    pub fn is_video(&self) -> bool {
        self.mime
            .get(..6)
            .is_some_and(|p| p.eq_ignore_ascii_case("video/"))
    }

    pub fn is_audio(&self) -> bool {
        self.mime
            .get(..6)
            .is_some_and(|p| p.eq_ignore_ascii_case("audio/"))
    }

    pub fn is_avc(&self) -> bool {
        self.mime.eq_ignore_ascii_case(MIME_VIDEO_AVC)
    }

    pub fn is_raw_audio(&self) -> bool {
        self.mime.eq_ignore_ascii_case(MIME_AUDIO_RAW)
    }
}

impl Display for MediaFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.width, self.height) {
            (Some(w), Some(h)) => write!(f, "{} {}x{}", self.mime, w, h)?,
            _ => write!(f, "{}", self.mime)?,
        }
        if let Some(bitrate) = self.bitrate {
            write!(f, " @{}bps", bitrate)?;
        }
        Ok(())
    }
}

/// Macroblocks refreshed per frame in cyclic intra-refresh mode.
pub fn intra_refresh_mbs(width: u32, height: u32, percent: u32) -> u32 {
    (width.div_ceil(16) * height.div_ceil(16) * percent) / 100
}
