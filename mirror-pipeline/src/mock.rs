//! In-memory stand-ins for the platform pieces, shared by the unit tests.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    access_unit::{AccessUnit, BufferFlags, ReleaseHandle, is_idr},
    backend::SessionBackend,
    codec::{CodecInput, CodecOutputBuffer, CodecParameter, DequeueOutput, MediaCodec},
    error::{PipelineError, PipelineResult},
    extractor::SampleExtractor,
    format::{MediaFormat, MediaKind},
    message::{Notify, now_us},
    puller::{MediaSource, SourceControl},
    sender::{Endpoint, MediaSender, SenderEvent, TrackFlags},
};

pub const MOCK_CSD: &[u8] = &[
    0, 0, 0, 1, 0x67, 0x42, 0, 0x1f, 0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80,
];

pub fn idr_frame(n: u8) -> Vec<u8> {
    vec![0, 0, 0, 1, 0x65, 0x88, n, 0]
}

pub fn p_frame(n: u8) -> Vec<u8> {
    vec![0, 0, 0, 1, 0x41, 0x9a, n, 0]
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls `cond` every 10ms for up to 3 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..300 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not met in time")
}

// ==== codec ====

#[derive(Debug, Clone)]
pub struct MockCodecConfig {
    pub input_count: usize,
    pub output_count: usize,
    pub reject_prepend: bool,
    pub fail_configure: bool,
    pub zero_copy: bool,
    /// Emit SPS/PPS as a codec-config buffer when a video encoder starts.
    pub emit_csd: bool,
}

impl Default for MockCodecConfig {
    fn default() -> Self {
        Self {
            input_count: 4,
            output_count: 8,
            reject_prepend: false,
            fail_configure: false,
            zero_copy: false,
            emit_csd: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockCodecState {
    pub config: MockCodecConfig,
    pub configured: Vec<MediaFormat>,
    pub started: bool,
    pub released: usize,
    pub free_inputs: VecDeque<usize>,
    pub outputs: VecDeque<DequeueOutput>,
    pub queued_inputs: Vec<CodecInput>,
    pub released_outputs: Vec<usize>,
    pub idr_requests: usize,
    pub parameters: Vec<CodecParameter>,
    next_output: usize,
}

impl MockCodecState {
    fn next_output_index(&mut self) -> usize {
        let index = self.next_output % self.config.output_count.max(1);
        self.next_output += 1;
        index
    }

    fn push_output(&mut self, data: Bytes, time_us: i64, flags: BufferFlags, zero_copy: bool) {
        let index = self.next_output_index();
        self.outputs.push_back(DequeueOutput::Buffer(CodecOutputBuffer {
            index,
            data,
            time_us,
            flags,
            zero_copy,
        }));
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockCodecHandle(Arc<Mutex<MockCodecState>>);

impl MockCodecHandle {
    pub fn lock(&self) -> MutexGuard<'_, MockCodecState> {
        lock(&self.0)
    }

    pub fn bitrates(&self) -> Vec<u32> {
        self.lock()
            .parameters
            .iter()
            .filter_map(|p| match p {
                CodecParameter::VideoBitrate(b) => Some(*b),
                _ => None,
            })
            .collect()
    }
}

/// Encoder that turns every input into one output buffer.
pub struct MockCodec {
    state: MockCodecHandle,
}

impl MockCodec {
    pub fn new(config: MockCodecConfig) -> (Self, MockCodecHandle) {
        let handle = MockCodecHandle::default();
        handle.lock().config = config;
        (
            Self {
                state: handle.clone(),
            },
            handle,
        )
    }
}

impl MediaCodec for MockCodec {
    fn name(&self) -> &str {
        "mock"
    }

    fn configure(&mut self, format: &MediaFormat) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.configured.push(format.clone());
        if state.config.fail_configure {
            return Err(PipelineError::EncoderConfig("rejected".to_string()));
        }
        if state.config.reject_prepend && format.prepend_sps_pps_to_idr {
            return Err(PipelineError::EncoderConfig(
                "prepend-sps-pps-to-idr-frames unsupported".to_string(),
            ));
        }
        Ok(())
    }

    fn start(&mut self) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.started = true;
        state.free_inputs = (0..state.config.input_count).collect();
        let video = state.configured.last().is_some_and(|f| f.is_video());
        if video && state.config.emit_csd {
            state.push_output(Bytes::from_static(MOCK_CSD), 0, BufferFlags::CODEC_CONFIG, false);
        }
        Ok(())
    }

    fn input_buffer_count(&self) -> usize {
        self.state.lock().config.input_count
    }

    fn output_buffer_count(&self) -> usize {
        self.state.lock().config.output_count
    }

    fn dequeue_input_buffer(&mut self) -> Option<usize> {
        self.state.lock().free_inputs.pop_front()
    }

    fn queue_input_buffer(&mut self, index: usize, input: CodecInput) -> PipelineResult<()> {
        let mut state = self.state.lock();
        state.queued_inputs.push(input.clone());
        if input.flags.contains(BufferFlags::EOS) {
            state.push_output(Bytes::new(), input.time_us, BufferFlags::EOS, false);
        } else {
            let flags = if is_idr(&input.data) {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::NONE
            };
            let zero_copy = state.config.zero_copy;
            state.push_output(input.data, input.time_us, flags, zero_copy);
        }
        // consumed right away, the slot comes back on the next dequeue
        state.free_inputs.push_back(index);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self) -> PipelineResult<DequeueOutput> {
        Ok(self
            .state
            .lock()
            .outputs
            .pop_front()
            .unwrap_or(DequeueOutput::TryAgain))
    }

    fn release_output_buffer(&mut self, index: usize) -> PipelineResult<()> {
        self.state.lock().released_outputs.push(index);
        Ok(())
    }

    fn request_idr_frame(&mut self) -> PipelineResult<()> {
        self.state.lock().idr_requests += 1;
        Ok(())
    }

    fn set_parameter(&mut self, parameter: CodecParameter) -> PipelineResult<()> {
        self.state.lock().parameters.push(parameter);
        Ok(())
    }

    fn release(&mut self) {
        self.state.lock().released += 1;
    }
}

// ==== source ====

#[derive(Debug, Default)]
struct MockSourceShared {
    started: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    rotation: AtomicI32,
    reads: AtomicUsize,
    released: AtomicUsize,
    woken: Mutex<bool>,
    cond: Condvar,
}

#[derive(Debug, Clone, Default)]
pub struct MockSourceProbe(Arc<MockSourceShared>);

impl MockSourceProbe {
    pub fn started(&self) -> bool {
        self.0.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.0.stopped.load(Ordering::SeqCst)
    }

    pub fn paused(&self) -> bool {
        self.0.paused.load(Ordering::SeqCst)
    }

    pub fn rotation(&self) -> i32 {
        self.0.rotation.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.0.reads.load(Ordering::SeqCst)
    }

    /// Media buffers handed back by the pipeline.
    pub fn released(&self) -> usize {
        self.0.released.load(Ordering::SeqCst)
    }
}

impl SourceControl for MockSourceProbe {
    fn wake_up(&self) {
        *lock(&self.0.woken) = true;
        self.0.cond.notify_all();
    }

    fn set_rotation(&self, degrees: i32) {
        self.0.rotation.store(degrees, Ordering::SeqCst);
    }
}

/// Holds a blocking call until opened.
#[derive(Debug, Clone, Default)]
pub struct MockGate(Arc<(Mutex<bool>, Condvar)>);

impl MockGate {
    pub fn open(&self) {
        *lock(&self.0.0) = true;
        self.0.1.notify_all();
    }

    fn wait(&self) {
        let mut open = lock(&self.0.0);
        while !*open {
            open = self.0.1.wait(open).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Source producing small H.264-like frames, each backed by a counted
/// media buffer.
pub struct MockSource {
    frames: Option<usize>,
    block_after: bool,
    interval: Duration,
    emitted: usize,
    pub fail_start: bool,
    pub stop_gate: Option<MockGate>,
    probe: MockSourceProbe,
}

impl MockSource {
    fn with(frames: Option<usize>, block_after: bool, interval: Duration) -> (Self, MockSourceProbe) {
        let probe = MockSourceProbe::default();
        (
            Self {
                frames,
                block_after,
                interval,
                emitted: 0,
                fail_start: false,
                stop_gate: None,
                probe: probe.clone(),
            },
            probe,
        )
    }

    /// `n` frames, then end of stream.
    pub fn finite(n: usize) -> (Self, MockSourceProbe) {
        Self::with(Some(n), false, Duration::ZERO)
    }

    /// `n` frames, then blocks until woken or stopped.
    pub fn finite_then_block(n: usize) -> (Self, MockSourceProbe) {
        Self::with(Some(n), true, Duration::ZERO)
    }

    /// A frame every `interval`, forever.
    pub fn endless(interval: Duration) -> (Self, MockSourceProbe) {
        Self::with(None, false, interval)
    }
}

impl MediaSource for MockSource {
    fn start(&mut self) -> PipelineResult<()> {
        if self.fail_start {
            return Err(PipelineError::Start("mock source refused".to_string()));
        }
        self.probe.0.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(gate) = &self.stop_gate {
            gate.wait();
        }
        self.probe.0.stopped.store(true, Ordering::SeqCst);
        self.probe.wake_up();
    }

    fn pause(&mut self) {
        self.probe.0.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&mut self) {
        self.probe.0.paused.store(false, Ordering::SeqCst);
    }

    fn read(&mut self) -> PipelineResult<Option<AccessUnit>> {
        if self.frames.is_some_and(|n| self.emitted >= n) {
            if !self.block_after {
                return Ok(None);
            }
            let shared = &self.probe.0;
            let mut woken = lock(&shared.woken);
            while !*woken && !shared.stopped.load(Ordering::SeqCst) {
                woken = shared.cond.wait(woken).unwrap_or_else(|e| e.into_inner());
            }
            *woken = false;
            return Ok(None);
        }

        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let n = self.emitted as u8;
        self.emitted += 1;
        self.probe.0.reads.fetch_add(1, Ordering::SeqCst);

        let data = if n % 10 == 0 { idr_frame(n) } else { p_frame(n) };
        let shared = self.probe.0.clone();
        Ok(Some(AccessUnit::new(data, now_us()).with_media_buffer(
            ReleaseHandle::new(move || {
                shared.released.fetch_add(1, Ordering::SeqCst);
            }),
        )))
    }

    fn control(&self) -> Option<Arc<dyn SourceControl>> {
        Some(Arc::new(self.probe.clone()))
    }
}

// ==== sender ====

#[derive(Debug)]
pub struct MockSenderState {
    pub tracks: Vec<(MediaFormat, TrackFlags)>,
    pub endpoint: Option<Endpoint>,
    // (sender track, timestamp, bytes)
    pub sent: Vec<(usize, i64, usize)>,
    pub held: Vec<AccessUnit>,
    pub notify: Option<Notify<SenderEvent>>,
    /// Posted as `InitDone` from `init_async`; None leaves it to the test.
    pub init_result: Option<PipelineResult<()>>,
    pub fail_init: bool,
    pub fail_queue: bool,
    /// Keep zero-copy units instead of releasing them after the send.
    pub hold_buffers: bool,
}

impl Default for MockSenderState {
    fn default() -> Self {
        Self {
            tracks: Vec::new(),
            endpoint: None,
            sent: Vec::new(),
            held: Vec::new(),
            notify: None,
            init_result: Some(Ok(())),
            fail_init: false,
            fail_queue: false,
            hold_buffers: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MockSenderHandle(Arc<Mutex<MockSenderState>>);

impl MockSenderHandle {
    pub fn lock(&self) -> MutexGuard<'_, MockSenderState> {
        lock(&self.0)
    }

    pub fn post(&self, event: SenderEvent) -> bool {
        let notify = self.lock().notify.clone();
        notify.is_some_and(|notify| notify.post(event))
    }

    pub fn sent_on(&self, track: usize) -> usize {
        self.lock().sent.iter().filter(|(t, _, _)| *t == track).count()
    }

    pub fn sent(&self) -> usize {
        self.lock().sent.len()
    }

    /// Acknowledges every held unit and reports the transport drained.
    pub fn release_held(&self) {
        let held: Vec<AccessUnit> = self.lock().held.drain(..).collect();
        for access_unit in &held {
            access_unit.release();
        }
        self.post(SenderEvent::Drained);
    }
}

pub struct MockSender {
    state: MockSenderHandle,
}

impl MockSender {
    pub fn new(state: MockSenderHandle) -> Self {
        Self { state }
    }
}

impl MediaSender for MockSender {
    fn add_track(&mut self, format: &MediaFormat, flags: TrackFlags) -> PipelineResult<usize> {
        let mut state = self.state.lock();
        state.tracks.push((format.clone(), flags));
        Ok(state.tracks.len() - 1)
    }

    fn init_async(&mut self, endpoint: &Endpoint, notify: Notify<SenderEvent>) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if state.fail_init {
            return Err(PipelineError::TransportInit(format!("cannot bind {}", endpoint)));
        }
        state.endpoint = Some(endpoint.clone());
        state.notify = Some(notify.clone());
        let result = state.init_result.clone();
        drop(state);
        if let Some(result) = result {
            notify.post(SenderEvent::InitDone(result));
        }
        Ok(())
    }

    fn queue_access_unit(&mut self, track_index: usize, access_unit: AccessUnit) -> PipelineResult<()> {
        let mut state = self.state.lock();
        if state.fail_queue {
            return Err(PipelineError::Transport("connection reset".to_string()));
        }
        state
            .sent
            .push((track_index, access_unit.time_us(), access_unit.len()));
        if state.hold_buffers && access_unit.is_zero_copy() {
            state.held.push(access_unit);
        } else {
            drop(state);
            access_unit.release();
        }
        Ok(())
    }

    fn pending_sends(&self) -> usize {
        self.state.lock().held.len()
    }
}

// ==== extractor ====

pub struct MockExtractor {
    formats: Vec<MediaFormat>,
    // (file track, sample time)
    samples: Vec<(usize, i64)>,
    pos: usize,
}

impl MockExtractor {
    pub fn new(formats: Vec<MediaFormat>, samples: Vec<(usize, i64)>) -> Self {
        Self {
            formats,
            samples,
            pos: 0,
        }
    }
}

impl SampleExtractor for MockExtractor {
    fn track_formats(&self) -> Vec<MediaFormat> {
        self.formats.clone()
    }

    fn select_track(&mut self, index: usize) -> PipelineResult<()> {
        if index >= self.formats.len() {
            return Err(PipelineError::Source(format!("no track {}", index)));
        }
        Ok(())
    }

    fn sample_time_us(&self) -> Option<i64> {
        self.samples.get(self.pos).map(|(_, time_us)| *time_us)
    }

    fn read_sample(&mut self) -> PipelineResult<(usize, AccessUnit)> {
        let (track, time_us) = self
            .samples
            .get(self.pos)
            .copied()
            .ok_or_else(|| PipelineError::Source("end of file".to_string()))?;
        Ok((track, AccessUnit::new(idr_frame(self.pos as u8), time_us)))
    }

    fn advance(&mut self) -> bool {
        self.pos += 1;
        self.pos < self.samples.len()
    }
}

// ==== backend ====

#[derive(Clone)]
pub struct MockBackend {
    pub sender: MockSenderHandle,
    pub codec: MockCodecConfig,
    pub codecs: Arc<Mutex<Vec<(MediaFormat, MockCodecHandle)>>>,
    pub sources: Arc<Mutex<Vec<(MediaKind, MockSourceProbe)>>>,
    pub frame_interval: Duration,
    pub fail_audio_source: bool,
    pub fail_video_start: bool,
    pub audio_stop_gate: Option<MockGate>,
    pub extractor: Option<(Vec<MediaFormat>, Vec<(usize, i64)>)>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            sender: MockSenderHandle::default(),
            codec: MockCodecConfig::default(),
            codecs: Arc::new(Mutex::new(Vec::new())),
            sources: Arc::new(Mutex::new(Vec::new())),
            frame_interval: Duration::from_millis(5),
            fail_audio_source: false,
            fail_video_start: false,
            audio_stop_gate: None,
            extractor: None,
        }
    }
}

impl MockBackend {
    pub fn codec(&self, kind: MediaKind) -> Option<MockCodecHandle> {
        lock(&self.codecs)
            .iter()
            .find(|(format, _)| format.kind() == kind)
            .map(|(_, handle)| handle.clone())
    }

    pub fn source(&self, kind: MediaKind) -> Option<MockSourceProbe> {
        lock(&self.sources)
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, probe)| probe.clone())
    }

    fn new_source(&self, kind: MediaKind) -> MockSource {
        let (mut source, probe) = MockSource::endless(self.frame_interval);
        source.fail_start = kind.is_video() && self.fail_video_start;
        if !kind.is_video() {
            source.stop_gate = self.audio_stop_gate.clone();
        }
        lock(&self.sources).push((kind, probe));
        source
    }
}

impl SessionBackend for MockBackend {
    fn create_sender(&mut self) -> PipelineResult<Box<dyn MediaSender>> {
        Ok(Box::new(MockSender::new(self.sender.clone())))
    }

    fn create_video_source(&mut self, _width: u32, _height: u32) -> PipelineResult<Box<dyn MediaSource>> {
        Ok(Box::new(self.new_source(MediaKind::Video)))
    }

    fn create_audio_source(&mut self) -> PipelineResult<Box<dyn MediaSource>> {
        if self.fail_audio_source {
            return Err(PipelineError::Source("no remote submix".to_string()));
        }
        Ok(Box::new(self.new_source(MediaKind::Audio)))
    }

    fn create_encoder(&mut self, format: &MediaFormat) -> PipelineResult<Box<dyn MediaCodec>> {
        let (codec, handle) = MockCodec::new(self.codec.clone());
        lock(&self.codecs).push((format.clone(), handle));
        Ok(Box::new(codec))
    }

    fn create_extractor(&mut self, path: &Path) -> PipelineResult<Box<dyn SampleExtractor>> {
        let (formats, samples) = self
            .extractor
            .clone()
            .ok_or_else(|| PipelineError::Source(format!("cannot open {}", path.display())))?;
        Ok(Box::new(MockExtractor::new(formats, samples)))
    }
}
