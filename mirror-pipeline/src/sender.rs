use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{
    access_unit::AccessUnit,
    error::{PipelineError, PipelineResult},
    format::MediaFormat,
    message::Notify,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Udp,
    Tcp,
    /// No RTCP channel.
    None,
}

/// Client address the transport binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub rtp_port: u16,
    #[serde(default)]
    pub rtp_mode: TransportMode,
    #[serde(default)]
    pub rtcp_port: Option<u16>,
    #[serde(default)]
    pub rtcp_mode: TransportMode,
}

impl Endpoint {
    pub fn udp(host: &str, rtp_port: u16) -> Self {
        Self {
            host: host.to_string(),
            rtp_port,
            rtp_mode: TransportMode::Udp,
            rtcp_port: rtp_port.checked_add(1),
            rtcp_mode: TransportMode::Udp,
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.rtp_port)?;
        if let Some(rtcp_port) = self.rtcp_port {
            write!(f, " (rtcp {})", rtcp_port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackFlags {
    /// IDR frames of this track already carry SPS/PPS spliced in by the
    /// converter.
    pub manually_prepend_sps_pps: bool,
}

/// Reports from the transport, posted into the session mailbox.
#[derive(Debug, Clone, PartialEq)]
pub enum SenderEvent {
    InitDone(PipelineResult<()>),
    Error(PipelineError),
    NetworkStall {
        bytes_queued: usize,
    },
    InformSender {
        avg_latency_us: i64,
        max_latency_us: i64,
    },
    /// Every queued access unit has been sent and released.
    Drained,
}

/// Packetizes access units and sends them to the client.
///
/// A zero-copy access unit must be released once its bytes are on the wire;
/// `pending_sends` counts units queued but not yet released.
pub trait MediaSender: Send {
    fn add_track(&mut self, format: &MediaFormat, flags: TrackFlags) -> PipelineResult<usize>;

    /// Binds to the client; completion is reported as `InitDone`.
    fn init_async(&mut self, endpoint: &Endpoint, notify: Notify<SenderEvent>) -> PipelineResult<()>;

    fn queue_access_unit(&mut self, track_index: usize, access_unit: AccessUnit) -> PipelineResult<()>;

    fn pending_sends(&self) -> usize;
}
