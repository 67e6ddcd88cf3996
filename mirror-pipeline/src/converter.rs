use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError, Sender},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    access_unit::{AccessUnit, BufferFlags, ReleaseHandle, is_idr},
    codec::{CodecInput, CodecOutputBuffer, CodecParameter, DequeueOutput, MediaCodec},
    config::EncoderConfig,
    error::{PipelineError, PipelineResult},
    format::{MediaFormat, MediaKind, intra_refresh_mbs},
    message::Notify,
    pcm::{PcmPacketizer, is_silence},
    puller::PullerEvent,
};

/// Events a converter posts to its owner.
#[derive(Debug)]
pub enum ConverterEvent {
    AccessUnit(AccessUnit),
    Eos,
    Error(PipelineError),
    ShutdownCompleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConverterFlags {
    /// Frames reach the encoder through its input surface, not input slots.
    pub surface_input: bool,
    pub prepend_csd_if_necessary: bool,
}

impl Default for ConverterFlags {
    fn default() -> Self {
        Self {
            surface_input: false,
            prepend_csd_if_necessary: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodePhase {
    Uninitialized,
    Initialized,
    Encoding,
    Draining,
    ShuttingDown,
    Shutdown,
}

impl EncodePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EncodePhase::Initialized,
            2 => EncodePhase::Encoding,
            3 => EncodePhase::Draining,
            4 => EncodePhase::ShuttingDown,
            5 => EncodePhase::Shutdown,
            _ => EncodePhase::Uninitialized,
        }
    }
}

/// Dropped frames are summarized at info level once per this many drops.
const DROP_LOG_INTERVAL: u64 = 30;

/// Counters shared between the codec worker and the converter handle.
#[derive(Debug, Default)]
pub struct ConverterStats {
    phase: AtomicU8,
    video_bitrate: AtomicU32,
    frames_in: AtomicU64,
    frames_dropped: AtomicU64,
    frames_queued: AtomicU64,
    access_units_out: AtomicU64,
    csd_prepended: AtomicU64,
    pending_releases: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConverterStatsSnapshot {
    pub phase: EncodePhase,
    pub video_bitrate: Option<u32>,
    pub frames_in: u64,
    pub frames_dropped: u64,
    pub frames_queued: u64,
    pub access_units_out: u64,
    pub csd_prepended: u64,
    pub pending_releases: u64,
}

impl ConverterStats {
    /// Counts one dropped frame; returns the running total when a summary is due.
    fn record_drop(&self) -> Option<u64> {
        let total = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        (total % DROP_LOG_INTERVAL == 0).then_some(total)
    }

    pub fn phase(&self) -> EncodePhase {
        EncodePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: EncodePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn frames_queued(&self) -> u64 {
        self.frames_queued.load(Ordering::Relaxed)
    }

    pub fn access_units_out(&self) -> u64 {
        self.access_units_out.load(Ordering::Relaxed)
    }

    pub fn csd_prepended(&self) -> u64 {
        self.csd_prepended.load(Ordering::Relaxed)
    }

    pub fn pending_releases(&self) -> u64 {
        self.pending_releases.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ConverterStatsSnapshot {
        let video_bitrate = self.video_bitrate.load(Ordering::Relaxed);
        ConverterStatsSnapshot {
            phase: self.phase(),
            video_bitrate: (video_bitrate > 0).then_some(video_bitrate),
            frames_in: self.frames_in(),
            frames_dropped: self.frames_dropped(),
            frames_queued: self.frames_queued(),
            access_units_out: self.access_units_out(),
            csd_prepended: self.csd_prepended(),
            pending_releases: self.pending_releases(),
        }
    }
}

pub(crate) enum ConverterCommand {
    Input(PullerEvent),
    RequestIdrFrame,
    Shutdown,
    DropAFrame,
    ReleaseOutputBuffer { index: usize },
    SuspendEncoding(bool),
    SetVideoBitrate(u32),
}

/// Handle to one encoder driven on a blocking codec worker.
///
/// Dropping the handle stops the worker once it has drained its queue.
pub struct Converter {
    kind: MediaKind,
    cancel: CancellationToken,
    tx: Sender<ConverterCommand>,
    stats: Arc<ConverterStats>,
    output_format: MediaFormat,
    needs_manual_csd: bool,
    input_buffer_count: usize,
}

impl Converter {
    /// Configures and starts the encoder, then spawns the codec worker.
    ///
    /// `codec` may be None only for raw PCM output, which needs no encoder.
    pub fn start(
        format: MediaFormat,
        flags: ConverterFlags,
        codec: Option<Box<dyn MediaCodec>>,
        config: EncoderConfig,
        notify: Notify<ConverterEvent>,
    ) -> PipelineResult<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let stats = Arc::new(ConverterStats::default());

        let mut state = ConverterState::new(
            format,
            flags,
            codec,
            config,
            notify,
            tx.clone(),
            stats.clone(),
        );
        if let Err(e) = state.init() {
            log::error!("failed to init {} converter: {}", state.kind, e);
            state.release_encoder();
            return Err(e);
        }

        let kind = state.kind;
        let output_format = state.format.clone();
        let needs_manual_csd = state.need_manual_prepend;
        let input_buffer_count = state
            .codec
            .as_ref()
            .map(|codec| codec.input_buffer_count())
            .unwrap_or(0);

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::task::spawn_blocking(move || Self::codec_loop(state, cancel_clone, rx));

        Ok(Self {
            kind,
            cancel,
            tx,
            stats,
            output_format,
            needs_manual_csd,
            input_buffer_count,
        })
    }

    fn codec_loop(mut state: ConverterState, cancel: CancellationToken, rx: Receiver<ConverterCommand>) {
        let poll_interval = Duration::from_millis(state.config.poll_interval_ms.max(1));
        log::info!("{} codec loop started ({})", state.kind, state.format.mime);
        loop {
            if cancel.is_cancelled() {
                while let Ok(cmd) = rx.try_recv() {
                    state.on_command(cmd);
                }
                state.release_encoder();
                break;
            }
            match rx.recv_timeout(poll_interval) {
                Ok(cmd) => state.on_command(cmd),
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => {
                    state.release_encoder();
                    break;
                }
            }
            state.on_poll();
        }
        log::info!("end of {} codec loop, phase {:?}", state.kind, state.phase);
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Format the encoder was configured with.
    pub fn output_format(&self) -> &MediaFormat {
        &self.output_format
    }

    /// The encoder cannot prepend SPS/PPS itself; IDR outputs get the cached
    /// codec config spliced in front.
    pub fn needs_manual_csd(&self) -> bool {
        self.needs_manual_csd
    }

    pub fn input_buffer_count(&self) -> usize {
        self.input_buffer_count
    }

    pub fn stats(&self) -> Arc<ConverterStats> {
        self.stats.clone()
    }

    pub fn phase(&self) -> EncodePhase {
        self.stats.phase()
    }

    /// Last bitrate pushed to the encoder.
    pub fn video_bitrate(&self) -> Option<u32> {
        self.stats.snapshot().video_bitrate
    }

    /// Mailbox a puller feeds raw access units into.
    pub fn input_notify(&self) -> Notify<PullerEvent> {
        Notify::from_std(self.tx.clone(), ConverterCommand::Input)
    }

    pub fn feed_access_unit(&self, access_unit: AccessUnit) {
        self.post(ConverterCommand::Input(PullerEvent::AccessUnit(access_unit)));
    }

    pub fn signal_eos(&self) {
        self.post(ConverterCommand::Input(PullerEvent::Eos));
    }

    pub fn request_idr_frame(&self) {
        self.post(ConverterCommand::RequestIdrFrame);
    }

    pub fn drop_a_frame(&self) {
        self.post(ConverterCommand::DropAFrame);
    }

    pub fn suspend_encoding(&self, suspend: bool) {
        self.post(ConverterCommand::SuspendEncoding(suspend));
    }

    pub fn set_video_bitrate(&self, bitrate: u32) {
        self.post(ConverterCommand::SetVideoBitrate(bitrate));
    }

    /// Posts `ShutdownCompleted` once the encoder has been released. Calling
    /// it again is a no-op.
    pub fn shutdown_async(&self) {
        self.post(ConverterCommand::Shutdown);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn post(&self, cmd: ConverterCommand) {
        if self.tx.send(cmd).is_err() {
            log::debug!("{} codec loop is gone", self.kind);
        }
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ==== codec worker state ====

struct ConverterState {
    kind: MediaKind,
    format: MediaFormat,
    flags: ConverterFlags,
    config: EncoderConfig,
    notify: Notify<ConverterEvent>,
    // posts zero-copy acknowledgements back to this worker
    self_tx: Sender<ConverterCommand>,
    stats: Arc<ConverterStats>,
    phase: EncodePhase,

    codec: Option<Box<dyn MediaCodec>>,
    is_pcm_audio: bool,
    is_h264: bool,
    failed: bool,

    // None marks end of stream
    input_queue: VecDeque<Option<AccessUnit>>,
    avail_input_indices: VecDeque<usize>,
    // media buffers owned by the encoder until their slot comes back
    input_slot_refs: HashMap<usize, ReleaseHandle>,

    csd0: Option<Bytes>,
    need_manual_prepend: bool,
    pcm: PcmPacketizer,

    prev_video_bitrate: Option<u32>,
    frames_to_drop: u32,
    suspended: bool,

    first_silent_frame: Option<Instant>,
    in_silent_mode: bool,

    pending_releases: usize,
    shutdown_deadline: Option<Instant>,
}

impl ConverterState {
    fn new(
        format: MediaFormat,
        flags: ConverterFlags,
        codec: Option<Box<dyn MediaCodec>>,
        config: EncoderConfig,
        notify: Notify<ConverterEvent>,
        self_tx: Sender<ConverterCommand>,
        stats: Arc<ConverterStats>,
    ) -> Self {
        Self {
            kind: format.kind(),
            is_pcm_audio: format.is_raw_audio(),
            is_h264: format.is_avc(),
            format,
            flags,
            config,
            notify,
            self_tx,
            stats,
            phase: EncodePhase::Uninitialized,
            codec,
            failed: false,
            input_queue: VecDeque::new(),
            avail_input_indices: VecDeque::new(),
            input_slot_refs: HashMap::new(),
            csd0: None,
            need_manual_prepend: false,
            pcm: PcmPacketizer::new(),
            prev_video_bitrate: None,
            frames_to_drop: 0,
            suspended: false,
            first_silent_frame: None,
            in_silent_mode: false,
            pending_releases: 0,
            shutdown_deadline: None,
        }
    }

    fn set_phase(&mut self, phase: EncodePhase) {
        self.phase = phase;
        self.stats.set_phase(phase);
    }

    fn init(&mut self) -> PipelineResult<()> {
        if self.is_pcm_audio {
            log::info!("raw audio output, no encoder needed");
            self.set_phase(EncodePhase::Initialized);
            return Ok(());
        }

        let Some(codec) = self.codec.as_mut() else {
            return Err(PipelineError::EncoderUnsupported(self.format.mime.clone()));
        };

        if self.kind.is_video() {
            let (Some(width), Some(height)) = (self.format.width, self.format.height) else {
                return Err(PipelineError::EncoderConfig(format!(
                    "{} is missing width or height",
                    self.format.mime
                )));
            };
            self.format.bitrate = Some(self.config.video_bitrate);
            self.format.constant_bitrate = true;
            self.format.frame_rate = Some(self.config.frame_rate);
            self.format.i_frame_interval = Some(self.config.i_frame_interval);
            self.format.intra_refresh_mbs = Some(intra_refresh_mbs(
                width,
                height,
                self.config.intra_refresh_percent,
            ));
            self.prev_video_bitrate = Some(self.config.video_bitrate);
            self.stats
                .video_bitrate
                .store(self.config.video_bitrate, Ordering::Relaxed);
        } else {
            self.format.bitrate = Some(self.config.audio_bitrate);
        }

        log::info!(
            "using audio bitrate of {} bps, video bitrate of {} bps",
            self.config.audio_bitrate,
            self.config.video_bitrate
        );

        self.need_manual_prepend = false;
        let mut configured = false;
        if self.kind.is_video() {
            let mut with_prepend = self.format.clone();
            with_prepend.prepend_sps_pps_to_idr = true;
            match codec.configure(&with_prepend) {
                Ok(()) => {
                    self.format = with_prepend;
                    configured = true;
                }
                Err(e) => {
                    log::info!(
                        "encoder {} cannot prepend SPS/PPS to IDR frames ({}), doing it manually",
                        codec.name(),
                        e
                    );
                    self.need_manual_prepend = true;
                }
            }
        }
        if !configured {
            codec.configure(&self.format)?;
        }

        if self.flags.surface_input && !self.kind.is_video() {
            return Err(PipelineError::EncoderConfig(
                "surface input requires a video encoder".to_string(),
            ));
        }

        codec.start()?;
        log::info!(
            "encoder {} started: {}, {} input / {} output buffers",
            codec.name(),
            self.format,
            codec.input_buffer_count(),
            codec.output_buffer_count()
        );
        self.set_phase(EncodePhase::Initialized);
        Ok(())
    }

    fn encoder_gone(&self) -> bool {
        matches!(
            self.phase,
            EncodePhase::ShuttingDown | EncodePhase::Shutdown
        ) || (!self.is_pcm_audio && self.codec.is_none())
    }

    fn on_command(&mut self, cmd: ConverterCommand) {
        match cmd {
            ConverterCommand::Input(event) => self.on_input(event),
            ConverterCommand::RequestIdrFrame => {
                if !self.kind.is_video() {
                    return;
                }
                if let Some(codec) = self.codec.as_mut() {
                    if let Err(e) = codec.request_idr_frame() {
                        log::warn!("failed to request IDR frame: {}", e);
                    }
                }
            }
            ConverterCommand::Shutdown => self.on_shutdown(),
            ConverterCommand::DropAFrame => {
                if self.flags.surface_input {
                    log::warn!("cannot drop frames of a surface-fed encoder");
                    return;
                }
                self.frames_to_drop += 1;
            }
            ConverterCommand::ReleaseOutputBuffer { index } => self.on_release_output_buffer(index),
            ConverterCommand::SuspendEncoding(suspend) => {
                log::info!("{} encoding {}", self.kind, if suspend { "suspended" } else { "resumed" });
                self.suspended = suspend;
                if self.flags.surface_input {
                    if let Some(codec) = self.codec.as_mut() {
                        if let Err(e) = codec.set_parameter(CodecParameter::DropInputFrames(suspend)) {
                            log::warn!("failed to set drop-input-frames: {}", e);
                        }
                    }
                }
            }
            ConverterCommand::SetVideoBitrate(bitrate) => self.on_set_video_bitrate(bitrate),
        }
    }

    fn on_set_video_bitrate(&mut self, bitrate: u32) {
        if !self.kind.is_video() || self.prev_video_bitrate == Some(bitrate) || self.encoder_gone() {
            return;
        }
        let Some(codec) = self.codec.as_mut() else {
            return;
        };
        match codec.set_parameter(CodecParameter::VideoBitrate(bitrate)) {
            Ok(()) => {
                log::info!("video bitrate {:?} -> {} bps", self.prev_video_bitrate, bitrate);
                self.prev_video_bitrate = Some(bitrate);
                self.stats.video_bitrate.store(bitrate, Ordering::Relaxed);
            }
            Err(e) => log::warn!("failed to set video bitrate {}: {}", bitrate, e),
        }
    }

    fn on_input(&mut self, event: PullerEvent) {
        if self.encoder_gone() {
            if let PullerEvent::AccessUnit(mut access_unit) = event {
                log::debug!("{} access unit after encoder release, discarding", self.kind);
                access_unit.release_media_buffer();
            }
            return;
        }

        match event {
            PullerEvent::Eos => {
                log::info!("{} input reached end of stream", self.kind);
                self.input_queue.push_back(None);
            }
            PullerEvent::AccessUnit(mut access_unit) => {
                self.stats.frames_in.fetch_add(1, Ordering::Relaxed);

                if self.frames_to_drop > 0 || self.suspended {
                    if self.frames_to_drop > 0 {
                        self.frames_to_drop -= 1;
                        log::debug!("dropping {} frame at {} us", self.kind, access_unit.time_us());
                    }
                    if let Some(total) = self.stats.record_drop() {
                        log::info!("{} frames dropped so far on {}", total, self.kind);
                    }
                    access_unit.release_media_buffer();
                    return;
                }

                if self.config.silence_detection && !self.kind.is_video() && self.is_silent(&access_unit) {
                    self.stats.record_drop();
                    access_unit.release_media_buffer();
                    return;
                }

                self.input_queue.push_back(Some(access_unit));
            }
        }

        if self.phase == EncodePhase::Initialized {
            self.set_phase(EncodePhase::Encoding);
        }
        if let Err(e) = self.feed_encoder_input_buffers() {
            self.on_error(e);
        }
    }

    fn is_silent(&mut self, access_unit: &AccessUnit) -> bool {
        if !is_silence(access_unit.data()) {
            if self.in_silent_mode {
                log::info!("audio no longer silent");
            }
            self.in_silent_mode = false;
            self.first_silent_frame = None;
            return false;
        }

        let now = Instant::now();
        match self.first_silent_frame {
            None => self.first_silent_frame = Some(now),
            Some(start) => {
                let window = Duration::from_millis(self.config.silence_window_ms);
                if !self.in_silent_mode && now.duration_since(start) >= window {
                    log::info!("audio in silent mode now");
                    self.in_silent_mode = true;
                }
            }
        }
        self.in_silent_mode
    }

    fn feed_encoder_input_buffers(&mut self) -> PipelineResult<()> {
        if self.is_pcm_audio {
            self.feed_raw_audio();
            return Ok(());
        }
        if self.flags.surface_input {
            return Ok(());
        }
        let Some(codec) = self.codec.as_mut() else {
            return Ok(());
        };

        while !self.input_queue.is_empty() && !self.avail_input_indices.is_empty() {
            let (Some(entry), Some(index)) = (
                self.input_queue.pop_front(),
                self.avail_input_indices.pop_front(),
            ) else {
                break;
            };

            let input = match entry {
                Some(mut access_unit) => {
                    if let Some(handle) = access_unit.take_media_buffer() {
                        if let Some(stale) = self.input_slot_refs.insert(index, handle) {
                            stale.release();
                        }
                    }
                    CodecInput {
                        data: access_unit.data().clone(),
                        time_us: access_unit.time_us(),
                        flags: BufferFlags::NONE,
                    }
                }
                None => {
                    self.phase = EncodePhase::Draining;
                    self.stats.set_phase(EncodePhase::Draining);
                    CodecInput::eos()
                }
            };

            let eos = input.flags.contains(BufferFlags::EOS);
            codec.queue_input_buffer(index, input)?;
            if !eos {
                self.stats.frames_queued.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    fn feed_raw_audio(&mut self) {
        while let Some(entry) = self.input_queue.pop_front() {
            match entry {
                Some(access_unit) => {
                    for payload in self.pcm.push(access_unit) {
                        self.emit(payload);
                    }
                }
                None => {
                    if let Some(payload) = self.pcm.flush() {
                        self.emit(payload);
                    }
                    self.set_phase(EncodePhase::Draining);
                    self.notify.post(ConverterEvent::Eos);
                }
            }
        }
    }

    fn on_poll(&mut self) {
        if self.phase == EncodePhase::ShuttingDown {
            if let Some(deadline) = self.shutdown_deadline {
                if Instant::now() >= deadline {
                    log::warn!(
                        "gave up waiting for {} zero-copy buffers from the transport",
                        self.pending_releases
                    );
                    self.finish_shutdown();
                }
            }
            return;
        }
        if self.failed || self.encoder_gone() || self.is_pcm_audio {
            return;
        }
        if let Err(e) = self.do_more_work() {
            self.on_error(e);
        }
    }

    fn do_more_work(&mut self) -> PipelineResult<()> {
        if !self.flags.surface_input {
            if let Some(codec) = self.codec.as_mut() {
                while let Some(index) = codec.dequeue_input_buffer() {
                    if let Some(handle) = self.input_slot_refs.remove(&index) {
                        handle.release();
                    }
                    self.avail_input_indices.push_back(index);
                }
            }
            self.feed_encoder_input_buffers()?;
        }

        loop {
            let Some(codec) = self.codec.as_mut() else {
                return Ok(());
            };
            let buffer = match codec.dequeue_output_buffer()? {
                DequeueOutput::Buffer(buffer) => buffer,
                DequeueOutput::FormatChanged | DequeueOutput::BuffersChanged => continue,
                DequeueOutput::TryAgain => break,
            };

            if buffer.flags.contains(BufferFlags::EOS) {
                codec.release_output_buffer(buffer.index)?;
                log::info!("{} encoder reached end of stream", self.kind);
                self.notify.post(ConverterEvent::Eos);
                break;
            }
            self.on_output_buffer(buffer)?;
        }
        Ok(())
    }

    fn on_output_buffer(&mut self, buffer: CodecOutputBuffer) -> PipelineResult<()> {
        let CodecOutputBuffer {
            index,
            data,
            time_us,
            flags,
            zero_copy,
        } = buffer;

        if flags.contains(BufferFlags::CODEC_CONFIG) {
            if self.is_h264 {
                log::debug!("caching {} bytes of codec config", data.len());
                self.csd0 = Some(data);
            }
            if let Some(codec) = self.codec.as_mut() {
                codec.release_output_buffer(index)?;
            }
            return Ok(());
        }

        let key_frame = flags.contains(BufferFlags::KEY_FRAME) || (self.is_h264 && is_idr(&data));
        let mut data = data;
        if key_frame && self.need_manual_prepend && self.flags.prepend_csd_if_necessary {
            match &self.csd0 {
                Some(csd) => {
                    let mut spliced = BytesMut::with_capacity(csd.len() + data.len());
                    spliced.extend_from_slice(csd);
                    spliced.extend_from_slice(&data);
                    data = spliced.freeze();
                    self.stats.csd_prepended.fetch_add(1, Ordering::Relaxed);
                }
                None => log::warn!("IDR frame at {} us before any codec config", time_us),
            }
        }

        let mut flags = flags;
        if key_frame {
            flags |= BufferFlags::KEY_FRAME;
        }
        let mut access_unit = AccessUnit::new(data, time_us).with_flags(flags);

        if zero_copy {
            let tx = self.self_tx.clone();
            access_unit = access_unit.with_release(ReleaseHandle::new(move || {
                let _ = tx.send(ConverterCommand::ReleaseOutputBuffer { index });
            }));
            self.pending_releases += 1;
            self.stats.pending_releases.fetch_add(1, Ordering::Relaxed);
        } else if let Some(codec) = self.codec.as_mut() {
            codec.release_output_buffer(index)?;
        }

        self.emit(access_unit);
        Ok(())
    }

    fn emit(&mut self, access_unit: AccessUnit) {
        self.stats.access_units_out.fetch_add(1, Ordering::Relaxed);
        if !self.notify.post(ConverterEvent::AccessUnit(access_unit)) {
            log::debug!("{} converter owner is gone, dropping output", self.kind);
        }
    }

    fn on_release_output_buffer(&mut self, index: usize) {
        if self.pending_releases > 0 {
            self.pending_releases -= 1;
            self.stats.pending_releases.fetch_sub(1, Ordering::Relaxed);
        }
        if let Some(codec) = self.codec.as_mut() {
            if let Err(e) = codec.release_output_buffer(index) {
                log::warn!("failed to return output buffer {}: {}", index, e);
            }
        }
        if self.phase == EncodePhase::ShuttingDown && self.pending_releases == 0 {
            self.finish_shutdown();
        }
    }

    fn on_error(&mut self, error: PipelineError) {
        log::error!("{} encoder failed: {}", self.kind, error);
        self.failed = true;
        self.notify.post(ConverterEvent::Error(error));
    }

    fn on_shutdown(&mut self) {
        if matches!(
            self.phase,
            EncodePhase::ShuttingDown | EncodePhase::Shutdown
        ) {
            log::debug!("{} converter already shutting down", self.kind);
            return;
        }

        log::info!("shutting down {} encoder", self.kind);
        self.set_phase(EncodePhase::ShuttingDown);
        self.release_queued_input();

        if self.pending_releases == 0 {
            self.finish_shutdown();
        } else {
            log::info!(
                "waiting for {} zero-copy buffers before releasing the encoder",
                self.pending_releases
            );
            self.shutdown_deadline =
                Some(Instant::now() + Duration::from_millis(self.config.shutdown_timeout_ms));
        }
    }

    fn finish_shutdown(&mut self) {
        self.release_encoder();
        self.set_phase(EncodePhase::Shutdown);
        self.shutdown_deadline = None;
        log::info!("{} encoder ({}) shut down", self.kind, self.format.mime);
        self.notify.post(ConverterEvent::ShutdownCompleted);
    }

    fn release_queued_input(&mut self) {
        for mut access_unit in self.input_queue.drain(..).flatten() {
            access_unit.release_media_buffer();
        }
        for (_, handle) in self.input_slot_refs.drain() {
            handle.release();
        }
        self.avail_input_indices.clear();
    }

    fn release_encoder(&mut self) {
        self.release_queued_input();
        self.pcm = PcmPacketizer::new();
        if let Some(mut codec) = self.codec.take() {
            log::info!("releasing encoder {}", codec.name());
            codec.release();
        }
        self.pending_releases = 0;
        self.stats.pending_releases.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[path = "converter_test.rs"]
mod converter_test;
