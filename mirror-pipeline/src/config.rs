use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// How a rate is driven by sink feedback.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControl<T> {
    /// Never touched after the encoder is configured.
    #[default]
    Off,
    /// Follows the latency reported by the sink.
    Adaptive,
    /// Pinned to a value, clamped to the allowed range.
    Fixed(T),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    // bps
    pub video_bitrate: u32,
    // bps
    pub audio_bitrate: u32,
    pub frame_rate: u32,
    // seconds
    pub i_frame_interval: u32,
    pub intra_refresh_percent: u32,
    pub silence_detection: bool,
    pub silence_window_ms: u64,
    /// Interval at which the codec worker polls the encoder when idle.
    pub poll_interval_ms: u64,
    /// Upper bound on waiting for zero-copy buffers during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            video_bitrate: 5_000_000,
            audio_bitrate: 128_000,
            frame_rate: 30,
            i_frame_interval: 15,
            intra_refresh_percent: 10,
            silence_detection: false,
            silence_window_ms: 10_000,
            poll_interval_ms: 5,
            shutdown_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub video_bitrate: RateControl<u32>,
    pub video_frame_rate: RateControl<f64>,
    pub high_latency_us: i64,
    pub low_latency_bitrate_us: i64,
    pub low_latency_frame_rate_us: i64,
    pub bitrate_decrease: f64,
    pub bitrate_increase: f64,
    pub frame_rate_decrease: f64,
    pub frame_rate_increase: f64,
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub min_frame_rate: f64,
    pub max_frame_rate: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            video_bitrate: RateControl::Off,
            video_frame_rate: RateControl::Off,
            high_latency_us: 300_000,
            low_latency_bitrate_us: 100_000,
            low_latency_frame_rate_us: 200_000,
            bitrate_decrease: 0.6,
            bitrate_increase: 1.1,
            frame_rate_decrease: 0.9,
            frame_rate_increase: 1.1,
            min_bitrate: 500_000,
            max_bitrate: 10_000_000,
            min_frame_rate: 5.0,
            max_frame_rate: 30.0,
        }
    }
}

impl AdaptiveConfig {
    pub fn adaptive() -> Self {
        Self {
            video_bitrate: RateControl::Adaptive,
            video_frame_rate: RateControl::Adaptive,
            ..Default::default()
        }
    }
}

/// Settings a playback session is built with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub disable_audio: bool,
    /// Wrap the video source so frames repeat at a controllable rate.
    pub use_repeater: bool,
    pub repeater_rate_hz: f64,
    /// A track with no output for this long counts as suspended.
    pub idle_suspend_ms: u64,
    pub encoder: EncoderConfig,
    pub adaptive: AdaptiveConfig,
    #[serde(skip)]
    pub debug: DebugConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            disable_audio: false,
            use_repeater: true,
            repeater_rate_hz: 30.0,
            idle_suspend_ms: 60,
            encoder: EncoderConfig::default(),
            adaptive: AdaptiveConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

/// Debug switches read from a `key=value` file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugConfig {
    pub debug: u64,
    pub source: Option<PathBuf>,
}

impl DebugConfig {
    pub const DEFAULT_PATH: &'static str = "/system/etc/wfd_source.conf";

    /// A missing or unreadable file yields the default config.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::parse(&text);
                log::info!(
                    "debug config {}: debug={} source={:?}",
                    path.display(),
                    config.debug,
                    config.source
                );
                config
            }
            Err(e) => {
                log::info!("no debug config at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Parsing stops at the first line without `=`.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                break;
            };
            match key.trim() {
                "debug" => config.debug = parse_unsigned(value.trim()),
                "source" => {
                    let value = value.trim();
                    config.source = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                _ => {}
            }
        }
        config
    }

    /// Local media file to stream instead of live capture.
    pub fn local_source(&self) -> Option<&Path> {
        if self.debug == 0 {
            return None;
        }
        self.source.as_deref()
    }
}

// Accepts decimal, 0x-prefixed hex and 0-prefixed octal; parsing stops at
// the first invalid digit.
fn parse_unsigned(text: &str) -> u64 {
    let (digits, radix) = if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };

    let mut value: u64 = 0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => value = value.saturating_mul(radix as u64).saturating_add(d as u64),
            None => break,
        }
    }
    value
}
