use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Context;
use mirror_pipeline::{DebugConfig, Endpoint, InitParams, SessionConfig};

use crate::media::EncoderKind;

const DEFAULT_OUTPUT_DIR: &str = "mirror-out";

pub struct SourceConfig {
    bind: SocketAddr,
    output_dir: PathBuf,
    debug_config: PathBuf,
    session_overrides: Option<PathBuf>,
    endpoint: Endpoint,
    use_pcm_audio: bool,
    encoder: EncoderKind,
}

impl SourceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("MIRROR_SOURCE_{}", name)).filter(|v| !v.is_empty());

        let bind = var("BIND")
            .and_then(|v| match v.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    log::warn!("invalid MIRROR_SOURCE_BIND {}: {}", v, e);
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));
        let host = var("SINK_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let rtp_port = var("SINK_PORT").and_then(|v| v.parse().ok()).unwrap_or(15550);
        // PCM goes out without an encoder, AAC needs one
        let use_pcm_audio = var("AAC").is_none_or(|v| v == "0");
        let encoder = parse_encoder(var("ENCODER").as_deref());

        Self {
            bind,
            output_dir: var("OUTPUT_DIR").unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()).into(),
            debug_config: var("DEBUG_CONFIG")
                .unwrap_or_else(|| DebugConfig::DEFAULT_PATH.to_string())
                .into(),
            session_overrides: var("SESSION_CONFIG").map(PathBuf::from),
            endpoint: Endpoint::udp(&host, rtp_port),
            use_pcm_audio,
            encoder,
        }
    }

    pub fn bind(&self) -> SocketAddr {
        self.bind
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn encoder(&self) -> EncoderKind {
        self.encoder
    }

    pub fn init_params(&self) -> InitParams {
        InitParams {
            use_pcm_audio: self.use_pcm_audio,
            ..InitParams::new(self.endpoint.clone())
        }
    }

    /// Session settings: defaults, then the JSON override file, then the
    /// debug key=value file.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.session_overrides {
            Some(path) => load_session_config(path)?,
            None => SessionConfig::default(),
        };
        config.debug = DebugConfig::load(&self.debug_config);
        Ok(config)
    }
}

fn parse_encoder(name: Option<&str>) -> EncoderKind {
    match name {
        Some("loopback") => EncoderKind::Loopback,
        #[cfg(feature = "ffmpeg")]
        Some("ffmpeg") | None => EncoderKind::Ffmpeg,
        #[cfg(not(feature = "ffmpeg"))]
        None => EncoderKind::Loopback,
        Some(other) => {
            log::warn!("unknown encoder {}, using the default", other);
            parse_encoder(None)
        }
    }
}

fn load_session_config(path: &Path) -> anyhow::Result<SessionConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read session config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse session config {}", path.display()))
}

pub fn config() -> &'static SourceConfig {
    static CONFIG: LazyLock<SourceConfig> = LazyLock::new(SourceConfig::from_env);
    &CONFIG
}
