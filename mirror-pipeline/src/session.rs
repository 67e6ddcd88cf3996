use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    access_unit::AccessUnit,
    adaptive::{AdaptationRecord, AdaptiveController, FeedbackSample},
    backend::SessionBackend,
    config::SessionConfig,
    converter::{Converter, ConverterEvent, ConverterFlags},
    error::{PipelineError, PipelineResult},
    extractor::SampleExtractor,
    format::{MIME_AUDIO_AAC, MIME_AUDIO_RAW, MediaFormat, MediaKind},
    message::{Notify, now_us},
    pcm::SAMPLE_RATE,
    puller::{MediaPuller, MediaSource},
    repeater::RepeaterSource,
    sender::{Endpoint, MediaSender, SenderEvent, TrackFlags},
    track::{Track, TrackStatus},
};

/// Negotiated parameters a session is initialized with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitParams {
    pub endpoint: Endpoint,
    #[serde(default = "default_true")]
    pub enable_audio: bool,
    #[serde(default)]
    pub use_pcm_audio: bool,
    #[serde(default = "default_true")]
    pub enable_video: bool,
    #[serde(default)]
    pub video_profile_idc: Option<u32>,
    #[serde(default)]
    pub video_level_idc: Option<u32>,
    #[serde(default)]
    pub video_constraint_set: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl InitParams {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            enable_audio: true,
            use_pcm_audio: false,
            enable_video: true,
            video_profile_idc: None,
            video_level_idc: None,
            video_constraint_set: None,
        }
    }
}

/// Notifications to the session owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEvent {
    Established,
    Dead,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Established,
    Playing,
    Paused,
    Destroying,
    Destroyed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub paused: bool,
    pub dead: bool,
    pub last_lifesign_us: i64,
    pub tracks: Vec<TrackStatus>,
    pub video_bitrate: Option<u32>,
    pub frame_rate: Option<f64>,
    pub pending_sends: usize,
    pub adaptations: Vec<AdaptationRecord>,
}

enum SessionCommand {
    Init {
        params: InitParams,
        result: oneshot::Sender<PipelineResult<()>>,
    },
    Play {
        result: oneshot::Sender<PipelineResult<()>>,
    },
    Pause {
        result: oneshot::Sender<PipelineResult<()>>,
    },
    DestroyAsync,
    RequestIdrFrame,
    SetVideoRotation(i32),
    ConverterNotify {
        track_index: usize,
        event: ConverterEvent,
    },
    SenderNotify(SenderEvent),
    PullerStopped {
        track_index: usize,
    },
    TrackStopped {
        track_index: usize,
    },
    PullExtractorSample {
        generation: u64,
    },
    Status {
        result: oneshot::Sender<SessionStatus>,
    },
}

/// One mirroring session: the tracks, the transport and the adaptive
/// controller, driven by a single control task.
pub struct PlaybackSession {
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    last_lifesign_us: Arc<AtomicI64>,
}

impl PlaybackSession {
    pub fn new(config: SessionConfig, backend: Box<dyn SessionBackend>) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let last_lifesign_us = Arc::new(AtomicI64::new(0));

        let state = SessionContext::new(
            config,
            backend,
            tx.clone(),
            events.clone(),
            last_lifesign_us.clone(),
        );
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, state).await });

        Self {
            cancel,
            tx,
            events,
            last_lifesign_us,
        }
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut state: SessionContext,
    ) {
        /// How often a destroying session re-checks for pending sends.
        const DRAIN_POLL: Duration = Duration::from_millis(20);
        let mut drain_check = tokio::time::interval(DRAIN_POLL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    if let Err(e) = Self::inner_command_handler(&mut state, cmd).await {
                        log::error!("session command error: {:#}", e);
                    }
                },
                _ = drain_check.tick(), if state.waiting_for_drain => {
                    state.maybe_finish_destroy();
                },
            }
        }
        log::info!("session loop finished in state {:?}", state.state);
    }

    async fn inner_command_handler(state: &mut SessionContext, cmd: SessionCommand) -> anyhow::Result<()> {
        match cmd {
            SessionCommand::Init { params, result } => {
                result
                    .send(state.on_init(params))
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            SessionCommand::Play { result } => {
                result
                    .send(state.on_play())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            SessionCommand::Pause { result } => {
                result
                    .send(state.on_pause())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
            SessionCommand::DestroyAsync => state.on_destroy(),
            SessionCommand::RequestIdrFrame => {
                for track in state.tracks.values() {
                    track.request_idr_frame();
                }
            }
            SessionCommand::SetVideoRotation(degrees) => state.on_set_video_rotation(degrees),
            SessionCommand::ConverterNotify { track_index, event } => {
                state.on_converter_notify(track_index, event)
            }
            SessionCommand::SenderNotify(event) => state.on_sender_notify(event).await,
            SessionCommand::PullerStopped { track_index } => {
                if let Some(track) = state.tracks.get_mut(&track_index) {
                    track.on_puller_stopped();
                }
            }
            SessionCommand::TrackStopped { track_index } => state.on_track_stopped(track_index),
            SessionCommand::PullExtractorSample { generation } => {
                if generation != state.pull_generation {
                    return Ok(());
                }
                state.pull_pending = false;
                state.on_pull_extractor();
            }
            SessionCommand::Status { result } => {
                result
                    .send(state.status())
                    .map_err(|_| anyhow::anyhow!("send result error: receiver dropped"))?;
            }
        }
        Ok(())
    }

    /// Creates the transport and the tracks. `Established` follows once the
    /// transport is connected.
    pub async fn init(&self, params: InitParams) -> PipelineResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Init { params, result: tx })?;
        rx.await.map_err(|_| PipelineError::ActorGone("session"))?
    }

    pub async fn play(&self) -> PipelineResult<()> {
        self.update_liveness();
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Play { result: tx })?;
        rx.await.map_err(|_| PipelineError::ActorGone("session"))?
    }

    pub async fn pause(&self) -> PipelineResult<()> {
        self.update_liveness();
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Pause { result: tx })?;
        rx.await.map_err(|_| PipelineError::ActorGone("session"))?
    }

    /// Stops every track; `Destroyed` follows once they have stopped and the
    /// transport has nothing left in flight.
    pub fn destroy_async(&self) {
        let _ = self.send(SessionCommand::DestroyAsync);
    }

    pub fn request_idr_frame(&self) {
        let _ = self.send(SessionCommand::RequestIdrFrame);
    }

    pub fn set_video_rotation(&self, degrees: i32) {
        let _ = self.send(SessionCommand::SetVideoRotation(degrees));
    }

    pub async fn status(&self) -> PipelineResult<SessionStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::Status { result: tx })?;
        rx.await.map_err(|_| PipelineError::ActorGone("session"))
    }

    /// Microseconds since the epoch of the last play, pause or init.
    pub fn last_lifesign_us(&self) -> i64 {
        self.last_lifesign_us.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> Pin<Box<dyn Stream<Item = SessionEvent> + Send>> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn update_liveness(&self) {
        self.last_lifesign_us.fetch_max(now_us(), Ordering::AcqRel);
    }

    fn send(&self, cmd: SessionCommand) -> PipelineResult<()> {
        self.tx
            .send(cmd)
            .map_err(|_| PipelineError::ActorGone("session"))
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        self.stop();
    }
}

// ==== session task state ====

struct SessionContext {
    config: SessionConfig,
    backend: Box<dyn SessionBackend>,
    tx: mpsc::UnboundedSender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
    last_lifesign_us: Arc<AtomicI64>,

    state: SessionState,
    paused: bool,
    dead: bool,
    waiting_for_drain: bool,

    sender: Option<Box<dyn MediaSender>>,
    tracks: BTreeMap<usize, Track>,
    next_track_index: usize,
    video_track_index: Option<usize>,
    adaptive: Option<AdaptiveController>,

    extractor: Option<Box<dyn SampleExtractor>>,
    // extractor track -> session track
    extractor_tracks: HashMap<usize, usize>,
    pull_generation: u64,
    pull_pending: bool,
    // (first sample time, wall clock at first sample)
    pull_time_base: Option<(i64, i64)>,
}

impl SessionContext {
    fn new(
        config: SessionConfig,
        backend: Box<dyn SessionBackend>,
        tx: mpsc::UnboundedSender<SessionCommand>,
        events: broadcast::Sender<SessionEvent>,
        last_lifesign_us: Arc<AtomicI64>,
    ) -> Self {
        Self {
            config,
            backend,
            tx,
            events,
            last_lifesign_us,
            state: SessionState::Created,
            paused: false,
            dead: false,
            waiting_for_drain: false,
            sender: None,
            tracks: BTreeMap::new(),
            next_track_index: 0,
            video_track_index: None,
            adaptive: None,
            extractor: None,
            extractor_tracks: HashMap::new(),
            pull_generation: 0,
            pull_pending: false,
            pull_time_base: None,
        }
    }

    fn update_liveness(&self) {
        self.last_lifesign_us.fetch_max(now_us(), Ordering::AcqRel);
    }

    fn notify(&self, event: SessionEvent) {
        log::info!("session event {:?}", event);
        // no subscriber is not an error
        let _ = self.events.send(event);
    }

    fn notify_session_dead(&mut self, reason: &PipelineError) {
        if self.dead {
            log::debug!("session already dead, ignoring: {}", reason);
            return;
        }
        log::error!("session dead: {}", reason);
        self.dead = true;
        self.notify(SessionEvent::Dead);
    }

    // ==== init ====

    fn on_init(&mut self, params: InitParams) -> PipelineResult<()> {
        if self.state != SessionState::Created || self.sender.is_some() {
            return Err(PipelineError::invalid_state(SessionState::Created, self.state));
        }

        match self.setup(&params) {
            Ok(()) => {
                log::info!(
                    "session initialized for {} with {} tracks",
                    params.endpoint,
                    self.tracks.len()
                );
                self.update_liveness();
                Ok(())
            }
            Err(e) => {
                log::error!("session init failed: {}", e);
                self.tracks.clear();
                self.sender = None;
                self.video_track_index = None;
                self.adaptive = None;
                self.extractor = None;
                self.extractor_tracks.clear();
                Err(e)
            }
        }
    }

    fn setup(&mut self, params: &InitParams) -> PipelineResult<()> {
        if !params.enable_audio && !params.enable_video {
            return Err(PipelineError::Config(
                "neither audio nor video is enabled".to_string(),
            ));
        }

        self.sender = Some(self.backend.create_sender()?);

        let local_source = self.config.debug.local_source().map(Path::to_path_buf);
        match local_source {
            Some(path) => self.setup_local_source(&path, params)?,
            None => {
                if params.enable_video {
                    self.add_video_source(params)?;
                }
                if params.enable_audio {
                    if self.config.disable_audio {
                        log::info!("audio disabled by config");
                    } else {
                        self.add_audio_source(params.use_pcm_audio)?;
                    }
                }
            }
        }

        let notify = Notify::from_unbounded(self.tx.clone(), SessionCommand::SenderNotify);
        let sender = self.sender_mut()?;
        sender
            .init_async(&params.endpoint, notify)
            .map_err(|e| match e {
                PipelineError::TransportInit(_) => e,
                other => PipelineError::TransportInit(other.to_string()),
            })
    }

    fn sender_mut(&mut self) -> PipelineResult<&mut Box<dyn MediaSender>> {
        self.sender
            .as_mut()
            .ok_or_else(|| PipelineError::TransportInit("no sender".to_string()))
    }

    fn add_video_source(&mut self, params: &InitParams) -> PipelineResult<()> {
        let (width, height) = (self.config.width, self.config.height);
        let mut source = self.backend.create_video_source(width, height)?;
        if self.config.use_repeater {
            source = Box::new(RepeaterSource::new(source, self.config.repeater_rate_hz));
        }

        let mut format = MediaFormat::video(width, height);
        format.profile_idc = params.video_profile_idc;
        format.level_idc = params.video_level_idc;
        format.constraint_set = params.video_constraint_set;
        self.add_source(MediaKind::Video, source, format)
    }

    fn add_audio_source(&mut self, use_pcm_audio: bool) -> PipelineResult<()> {
        let source = match self.backend.create_audio_source() {
            Ok(source) => source,
            Err(e) => {
                log::warn!("unable to instantiate audio source, continuing without audio: {}", e);
                return Ok(());
            }
        };
        let mime = if use_pcm_audio {
            MIME_AUDIO_RAW
        } else {
            MIME_AUDIO_AAC
        };
        self.add_source(MediaKind::Audio, source, MediaFormat::audio(mime, SAMPLE_RATE, 2))
    }

    fn add_source(
        &mut self,
        kind: MediaKind,
        source: Box<dyn MediaSource>,
        format: MediaFormat,
    ) -> PipelineResult<()> {
        let track_index = self.next_track_index;

        let codec = if format.is_raw_audio() {
            None
        } else {
            Some(self.backend.create_encoder(&format)?)
        };
        let converter = Converter::start(
            format,
            ConverterFlags::default(),
            codec,
            self.config.encoder.clone(),
            self.converter_notify(track_index),
        )?;
        let puller = MediaPuller::new(
            kind,
            source,
            converter.input_notify(),
            Notify::from_unbounded(self.tx.clone(), move |()| SessionCommand::PullerStopped {
                track_index,
            }),
        );

        let flags = TrackFlags {
            manually_prepend_sps_pps: converter.needs_manual_csd(),
        };
        let mut track = Track::new_encoded(
            track_index,
            converter,
            Some(puller),
            self.idle_suspend(),
            self.track_stopped_notify(track_index),
        );

        let sender_index = self.sender_mut()?.add_track(track.format(), flags)?;
        track.set_sender_track_index(sender_index);

        if kind.is_video() {
            let bitrate = track
                .converter()
                .and_then(|c| c.video_bitrate())
                .unwrap_or(self.config.encoder.video_bitrate);
            let frame_rate = track.source_control().and_then(|c| c.frame_rate());
            self.adaptive = Some(AdaptiveController::new(
                self.config.adaptive.clone(),
                bitrate,
                frame_rate,
            ));
            self.video_track_index = Some(track_index);
        }

        log::info!("added {} track {}: {}", kind, track_index, track.format());
        self.tracks.insert(track_index, track);
        self.next_track_index += 1;
        Ok(())
    }

    fn setup_local_source(&mut self, path: &Path, params: &InitParams) -> PipelineResult<()> {
        log::info!("streaming local file {}", path.display());
        let mut extractor = self.backend.create_extractor(path)?;

        let mut have_audio = false;
        let mut have_video = false;
        for (file_track, format) in extractor.track_formats().into_iter().enumerate() {
            if format.is_audio() && params.enable_audio && !have_audio {
                have_audio = true;
            } else if format.is_video() && params.enable_video && !have_video {
                have_video = true;
            } else {
                continue;
            }

            extractor.select_track(file_track)?;

            let track_index = self.next_track_index;
            let mut track = Track::new_passthrough(
                track_index,
                format,
                self.idle_suspend(),
                self.track_stopped_notify(track_index),
            );
            let flags = TrackFlags {
                manually_prepend_sps_pps: true,
            };
            let sender_index = self.sender_mut()?.add_track(track.format(), flags)?;
            track.set_sender_track_index(sender_index);

            if track.is_video() {
                self.video_track_index = Some(track_index);
            }
            log::info!("file track {} -> {} track {}", file_track, track.kind(), track_index);
            self.tracks.insert(track_index, track);
            self.extractor_tracks.insert(file_track, track_index);
            self.next_track_index += 1;

            if (have_audio || !params.enable_audio) && (have_video || !params.enable_video) {
                break;
            }
        }

        if self.tracks.is_empty() {
            return Err(PipelineError::Source(format!(
                "no usable track in {}",
                path.display()
            )));
        }
        self.extractor = Some(extractor);
        Ok(())
    }

    fn idle_suspend(&self) -> Duration {
        Duration::from_millis(self.config.idle_suspend_ms)
    }

    fn converter_notify(&self, track_index: usize) -> Notify<ConverterEvent> {
        Notify::from_unbounded(self.tx.clone(), move |event| SessionCommand::ConverterNotify {
            track_index,
            event,
        })
    }

    fn track_stopped_notify(&self, track_index: usize) -> Notify<()> {
        Notify::from_unbounded(self.tx.clone(), move |()| SessionCommand::TrackStopped {
            track_index,
        })
    }

    // ==== transport ====

    async fn on_sender_notify(&mut self, event: SenderEvent) {
        match event {
            SenderEvent::InitDone(Ok(())) => self.on_sender_initialized().await,
            SenderEvent::InitDone(Err(e)) | SenderEvent::Error(e) => self.notify_session_dead(&e),
            SenderEvent::NetworkStall { bytes_queued } => {
                log::debug!("network stall, {} bytes queued", bytes_queued);
                if let Some(converter) = self.video_converter() {
                    converter.drop_a_frame();
                }
            }
            SenderEvent::InformSender {
                avg_latency_us,
                max_latency_us,
            } => self.on_sink_feedback(FeedbackSample {
                avg_latency_us,
                max_latency_us,
                stalled: false,
            }),
            SenderEvent::Drained => self.maybe_finish_destroy(),
        }
    }

    async fn on_sender_initialized(&mut self) {
        if self.state != SessionState::Created {
            log::debug!("transport ready in state {:?}, ignoring", self.state);
            return;
        }

        let mut failure = None;
        for track in self.tracks.values_mut() {
            if let Err(e) = track.start().await {
                log::error!("failed to start {} track {}: {}", track.kind(), track.index(), e);
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.notify_session_dead(&e);
            return;
        }

        self.state = SessionState::Established;
        self.notify(SessionEvent::Established);
        if self.extractor.is_some() {
            self.schedule_pull_extractor();
        }
    }

    fn video_track(&self) -> Option<&Track> {
        self.video_track_index.and_then(|index| self.tracks.get(&index))
    }

    fn video_converter(&self) -> Option<&Converter> {
        self.video_track().and_then(|track| track.converter())
    }

    fn on_sink_feedback(&mut self, sample: FeedbackSample) {
        log::info!(
            "sink reports avg. latency of {} ms (max {} ms)",
            sample.avg_latency_us / 1000,
            sample.max_latency_us / 1000
        );

        let Some(video_index) = self.video_track_index else {
            return;
        };
        let Some(track) = self.tracks.get(&video_index) else {
            return;
        };
        let control = track.source_control();
        let Some(controller) = self.adaptive.as_mut() else {
            return;
        };

        controller.set_frame_rate(control.as_ref().and_then(|c| c.frame_rate()));
        let adaptation = controller.on_feedback(&sample);

        if let Some(bitrate) = adaptation.video_bitrate {
            log::info!("setting video bitrate to {} bps", bitrate);
            if let Some(converter) = track.converter() {
                converter.set_video_bitrate(bitrate);
            }
        }
        if let (Some(rate), Some(control)) = (adaptation.frame_rate, control) {
            log::info!("setting frame rate to {:.2} Hz", rate);
            control.set_frame_rate(rate);
        }
    }

    // ==== converter output ====

    fn on_converter_notify(&mut self, track_index: usize, event: ConverterEvent) {
        if let ConverterEvent::ShutdownCompleted = event {
            if let Some(track) = self.tracks.get_mut(&track_index) {
                track.on_converter_shutdown();
            }
            return;
        }

        if self.dead {
            log::debug!("dropping converter event of track {}, session is dead", track_index);
            return;
        }

        match event {
            ConverterEvent::AccessUnit(access_unit) => {
                let Some(track) = self.tracks.get_mut(&track_index) else {
                    return;
                };
                track.queue_output_buffer(access_unit);
                if !self.paused {
                    self.forward_track_output(track_index);
                }
            }
            ConverterEvent::Eos => {
                log::info!("output EOS on track {}", track_index);
                if let Some(track) = self.tracks.get_mut(&track_index) {
                    track.stop_async();
                }
            }
            ConverterEvent::Error(e) => {
                log::error!("converter of track {} signaled error: {}", track_index, e);
                self.notify_session_dead(&e);
            }
            ConverterEvent::ShutdownCompleted => {}
        }
    }

    fn forward_track_output(&mut self, track_index: usize) {
        if self.dead {
            return;
        }
        let Some(track) = self.tracks.get_mut(&track_index) else {
            return;
        };
        let Some(sender_index) = track.sender_track_index() else {
            return;
        };
        let Some(sender) = self.sender.as_mut() else {
            return;
        };

        let mut failure = None;
        while let Some(access_unit) = track.dequeue_output_buffer() {
            if let Err(e) = sender.queue_access_unit(sender_index, access_unit) {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.notify_session_dead(&e);
        }
    }

    fn on_track_stopped(&mut self, track_index: usize) {
        let Some(track) = self.tracks.remove(&track_index) else {
            return;
        };
        log::info!("{} track {} stopped", track.kind(), track_index);
        drop(track);

        if self.video_track_index == Some(track_index) {
            self.video_track_index = None;
        }
        self.extractor_tracks.retain(|_, index| *index != track_index);

        if !self.tracks.is_empty() {
            log::info!("not all tracks are stopped yet");
            return;
        }
        if self.state == SessionState::Destroying {
            self.maybe_finish_destroy();
        } else {
            log::info!("reached EOS");
        }
    }

    // ==== control ====

    fn on_play(&mut self) -> PipelineResult<()> {
        match self.state {
            SessionState::Established | SessionState::Playing | SessionState::Paused => {}
            state => {
                return Err(PipelineError::invalid_state(SessionState::Established, state));
            }
        }

        self.state = SessionState::Playing;
        if self.paused {
            for track in self.tracks.values_mut() {
                track.resume();
            }
            self.paused = false;

            let indices: Vec<usize> = self.tracks.keys().copied().collect();
            for index in indices {
                self.forward_track_output(index);
            }
        }

        if self.extractor.is_some() {
            self.schedule_pull_extractor();
        }
        Ok(())
    }

    fn on_pause(&mut self) -> PipelineResult<()> {
        match self.state {
            SessionState::Established | SessionState::Playing | SessionState::Paused => {}
            state => {
                return Err(PipelineError::invalid_state(SessionState::Established, state));
            }
        }

        if self.extractor.is_some() {
            self.pull_generation += 1;
            self.pull_pending = false;
            self.pull_time_base = None;
        }
        if self.paused {
            return Ok(());
        }

        for track in self.tracks.values_mut() {
            track.pause();
        }
        self.paused = true;
        self.state = SessionState::Paused;
        Ok(())
    }

    fn on_set_video_rotation(&mut self, degrees: i32) {
        match self.video_track().and_then(|track| track.source_control()) {
            Some(control) => {
                log::info!("video rotation {} degrees", degrees);
                control.set_rotation(degrees);
            }
            None => log::debug!("no video source to rotate"),
        }
    }

    fn on_destroy(&mut self) {
        if matches!(self.state, SessionState::Destroying | SessionState::Destroyed) {
            return;
        }
        log::info!("destroying session with {} tracks", self.tracks.len());
        self.state = SessionState::Destroying;
        self.pull_generation += 1;
        self.pull_pending = false;

        if self.tracks.is_empty() {
            self.maybe_finish_destroy();
            return;
        }
        for track in self.tracks.values_mut() {
            track.stop_async();
        }
    }

    fn maybe_finish_destroy(&mut self) {
        if self.state != SessionState::Destroying || !self.tracks.is_empty() {
            return;
        }
        let pending = self.sender.as_ref().map(|s| s.pending_sends()).unwrap_or(0);
        if pending > 0 {
            if !self.waiting_for_drain {
                log::info!("waiting for {} pending sends", pending);
            }
            self.waiting_for_drain = true;
            return;
        }

        self.waiting_for_drain = false;
        self.sender = None;
        self.extractor = None;
        self.adaptive = None;
        self.state = SessionState::Destroyed;
        self.notify(SessionEvent::Destroyed);
    }

    // ==== local file source ====

    fn schedule_pull_extractor(&mut self) {
        if self.pull_pending || self.paused {
            return;
        }
        let Some(extractor) = self.extractor.as_ref() else {
            return;
        };
        let Some(sample_time_us) = extractor.sample_time_us() else {
            log::info!("local source reached end of stream");
            return;
        };

        let now = now_us();
        let (first_sample_us, first_real_us) =
            *self.pull_time_base.get_or_insert((sample_time_us, now));
        let when_us = sample_time_us - first_sample_us + first_real_us;
        let delay = Duration::from_micros((when_us - now).max(0) as u64);

        let tx = self.tx.clone();
        let generation = self.pull_generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionCommand::PullExtractorSample { generation });
        });
        self.pull_pending = true;
    }

    fn on_pull_extractor(&mut self) {
        let (Some(extractor), Some((first_sample_us, first_real_us))) =
            (self.extractor.as_mut(), self.pull_time_base)
        else {
            return;
        };

        let (file_track, sample) = match extractor.read_sample() {
            Ok(sample) => sample,
            Err(e) => {
                log::info!("local source done: {}", e);
                return;
            }
        };
        let time_us = first_real_us + sample.time_us() - first_sample_us;
        let access_unit = AccessUnit::new(sample.data().clone(), time_us).with_flags(sample.flags());
        extractor.advance();

        if let Some(&track_index) = self.extractor_tracks.get(&file_track) {
            if let Some(track) = self.tracks.get_mut(&track_index) {
                track.queue_access_unit(access_unit);
            }
            if !self.paused {
                self.forward_track_output(track_index);
            }
        }

        self.schedule_pull_extractor();
    }

    // ==== status ====

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            paused: self.paused,
            dead: self.dead,
            last_lifesign_us: self.last_lifesign_us.load(Ordering::Acquire),
            tracks: self.tracks.values().map(|track| track.status()).collect(),
            video_bitrate: self
                .video_converter()
                .and_then(|converter| converter.video_bitrate()),
            frame_rate: self
                .video_track()
                .and_then(|track| track.source_control())
                .and_then(|control| control.frame_rate()),
            pending_sends: self.sender.as_ref().map(|s| s.pending_sends()).unwrap_or(0),
            adaptations: self
                .adaptive
                .as_ref()
                .map(|controller| controller.history().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
