use std::{
    f64::consts::TAU,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicI32, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{BufMut, BytesMut};
use mirror_pipeline::{
    AccessUnit, MediaSource, PipelineError, PipelineResult, SourceControl,
    message::now_us,
    pcm::{FRAME_SIZE, SAMPLE_RATE},
};

#[derive(Debug, Default)]
struct ClockShared {
    woken: Mutex<bool>,
    cond: Condvar,
    stopped: AtomicBool,
    rotation: AtomicI32,
}

impl ClockShared {
    fn wake(&self) {
        *self.woken.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_all();
    }
}

/// Paces a synthetic source at a fixed interval; `wake_up` cuts the current
/// wait short.
#[derive(Debug)]
struct SourceClock {
    shared: Arc<ClockShared>,
    interval: Duration,
    start: Option<Instant>,
    ticks: u32,
}

impl SourceClock {
    fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(ClockShared::default()),
            interval,
            start: None,
            ticks: 0,
        }
    }

    fn start(&mut self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
        self.start = Some(Instant::now());
        self.ticks = 0;
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.wake();
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn rotation(&self) -> i32 {
        self.shared.rotation.load(Ordering::SeqCst)
    }

    /// Blocks until the next tick is due; returns the tick number.
    fn wait_tick(&mut self) -> u32 {
        let start = *self.start.get_or_insert_with(Instant::now);
        let deadline = start + self.interval * self.ticks;

        let mut woken = self.shared.woken.lock().unwrap_or_else(|e| e.into_inner());
        while !*woken && !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            woken = self
                .shared
                .cond
                .wait_timeout(woken, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        *woken = false;

        let tick = self.ticks;
        self.ticks += 1;
        tick
    }

    fn control(&self) -> Arc<dyn SourceControl> {
        Arc::new(ClockControl(self.shared.clone()))
    }
}

struct ClockControl(Arc<ClockShared>);

impl SourceControl for ClockControl {
    fn wake_up(&self) {
        self.0.wake();
    }

    fn set_rotation(&self, degrees: i32) {
        log::info!("test pattern rotation {}", degrees);
        self.0.rotation.store(degrees, Ordering::SeqCst);
    }
}

// ==== video ====

const BAR_WIDTH: usize = 16;
const BAR_STEP: usize = 8;

/// I420 frames with a gradient background and a sweeping bar. The bar runs
/// vertically when the display is rotated by 90 or 270 degrees.
pub struct TestPatternSource {
    width: usize,
    height: usize,
    clock: SourceClock,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width: width as usize,
            height: height as usize,
            clock: SourceClock::new(Duration::from_secs(1) / frame_rate.max(1)),
        }
    }

    fn frame_size(&self) -> usize {
        let (cw, ch) = (self.width.div_ceil(2), self.height.div_ceil(2));
        self.width * self.height + 2 * cw * ch
    }

    fn render(&self, tick: u32) -> BytesMut {
        let (w, h) = (self.width, self.height);
        let mut frame = BytesMut::with_capacity(self.frame_size());

        let vertical = matches!(self.clock.rotation().rem_euclid(360), 90 | 270);
        let span = if vertical { h } else { w };
        let bar = (tick as usize * BAR_STEP) % span.max(1);

        for y in 0..h {
            for x in 0..w {
                let pos = if vertical { y } else { x };
                let luma = if pos >= bar && pos < bar + BAR_WIDTH {
                    235
                } else {
                    16 + ((x + y) * 128 / (w + h).max(1)) as u8
                };
                frame.put_u8(luma);
            }
        }
        let chroma = w.div_ceil(2) * h.div_ceil(2);
        frame.put_bytes(128, chroma);
        frame.put_bytes(128, chroma);
        frame
    }
}

impl MediaSource for TestPatternSource {
    fn start(&mut self) -> PipelineResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(PipelineError::Start(format!(
                "invalid size {}x{}",
                self.width, self.height
            )));
        }
        log::info!("test pattern {}x{} started", self.width, self.height);
        self.clock.start();
        Ok(())
    }

    fn stop(&mut self) {
        self.clock.stop();
    }

    fn read(&mut self) -> PipelineResult<Option<AccessUnit>> {
        let tick = self.clock.wait_tick();
        if self.clock.is_stopped() {
            return Ok(None);
        }
        Ok(Some(AccessUnit::new(self.render(tick).freeze(), now_us())))
    }

    fn control(&self) -> Option<Arc<dyn SourceControl>> {
        Some(self.clock.control())
    }
}

// ==== audio ====

const TONE_HZ: f64 = 440.0;
const TONE_AMPLITUDE: f64 = 0.2;
/// Frames per read, 10ms at 48 kHz.
const TONE_CHUNK_FRAMES: usize = 480;

/// Stereo 16 bit sine at 48 kHz, host byte order, read in 10ms chunks.
pub struct ToneSource {
    frame: u64,
    clock: SourceClock,
}

impl ToneSource {
    pub fn new() -> Self {
        Self {
            frame: 0,
            clock: SourceClock::new(Duration::from_millis(10)),
        }
    }

    fn render(&mut self) -> BytesMut {
        let mut chunk = BytesMut::with_capacity(TONE_CHUNK_FRAMES * FRAME_SIZE);
        for _ in 0..TONE_CHUNK_FRAMES {
            let t = self.frame as f64 / SAMPLE_RATE as f64;
            let sample = ((TAU * TONE_HZ * t).sin() * TONE_AMPLITUDE * i16::MAX as f64) as i16;
            chunk.put_i16_ne(sample);
            chunk.put_i16_ne(sample);
            self.frame += 1;
        }
        chunk
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaSource for ToneSource {
    fn start(&mut self) -> PipelineResult<()> {
        log::info!("tone source started");
        self.frame = 0;
        self.clock.start();
        Ok(())
    }

    fn stop(&mut self) {
        self.clock.stop();
    }

    fn read(&mut self) -> PipelineResult<Option<AccessUnit>> {
        self.clock.wait_tick();
        if self.clock.is_stopped() {
            return Ok(None);
        }
        Ok(Some(AccessUnit::new(self.render().freeze(), now_us())))
    }

    fn control(&self) -> Option<Arc<dyn SourceControl>> {
        Some(self.clock.control())
    }
}

#[cfg(test)]
#[path = "source_test.rs"]
mod source_test;
