use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    access_unit::AccessUnit,
    error::{PipelineError, PipelineResult},
    message::now_us,
    puller::{MediaSource, SourceControl},
};

#[derive(Debug)]
struct RepeaterShared {
    // latest frame read from the wrapped source
    last: Option<AccessUnit>,
    rate_hz: f64,
    start: Option<Instant>,
    frame_count: u64,
    woken: bool,
    eos: bool,
    stopping: bool,
}

#[derive(Debug)]
struct Repeater {
    shared: Mutex<RepeaterShared>,
    cond: Condvar,
}

impl Repeater {
    fn lock(&self) -> MutexGuard<'_, RepeaterShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Re-emits the most recent frame of a wrapped source at an adjustable rate.
///
/// A background reader keeps pulling the wrapped source; `read` paces output
/// by `rate_hz` regardless of how often the wrapped source produces.
pub struct RepeaterSource {
    inner: Option<Box<dyn MediaSource>>,
    inner_control: Option<Arc<dyn SourceControl>>,
    repeater: Arc<Repeater>,
    reader: Option<JoinHandle<()>>,
}

impl RepeaterSource {
    pub fn new(inner: Box<dyn MediaSource>, rate_hz: f64) -> Self {
        let inner_control = inner.control();
        Self {
            inner: Some(inner),
            inner_control,
            repeater: Arc::new(Repeater {
                shared: Mutex::new(RepeaterShared {
                    last: None,
                    rate_hz,
                    start: None,
                    frame_count: 0,
                    woken: false,
                    eos: false,
                    stopping: false,
                }),
                cond: Condvar::new(),
            }),
            reader: None,
        }
    }

    fn read_loop(mut inner: Box<dyn MediaSource>, repeater: Arc<Repeater>) {
        loop {
            if repeater.lock().stopping {
                break;
            }
            let next = inner.read();
            let mut shared = repeater.lock();
            match next {
                Ok(Some(mut access_unit)) => {
                    // the repeated copies share the payload, the pool slot goes back now
                    access_unit.release_media_buffer();
                    shared.last = Some(access_unit);
                }
                Ok(None) => {
                    shared.eos = true;
                }
                Err(e) => {
                    log::error!("repeater source read failed: {}", e);
                    shared.eos = true;
                }
            }
            let done = shared.eos;
            drop(shared);
            repeater.cond.notify_all();
            if done {
                break;
            }
        }
        inner.stop();
        log::debug!("repeater reader finished");
    }
}

impl MediaSource for RepeaterSource {
    fn start(&mut self) -> PipelineResult<()> {
        let mut inner = self
            .inner
            .take()
            .ok_or_else(|| PipelineError::Start("repeater source already started".to_string()))?;
        inner.start()?;

        {
            let mut shared = self.repeater.lock();
            shared.stopping = false;
            shared.eos = false;
            shared.frame_count = 0;
            shared.start = None;
        }

        let repeater = self.repeater.clone();
        let reader = std::thread::Builder::new()
            .name("repeater-reader".to_string())
            .spawn(move || Self::read_loop(inner, repeater))
            .map_err(|e| PipelineError::Start(format!("failed to spawn repeater reader: {}", e)))?;
        self.reader = Some(reader);
        Ok(())
    }

    fn stop(&mut self) {
        self.repeater.lock().stopping = true;
        self.repeater.cond.notify_all();
        if let Some(control) = &self.inner_control {
            control.wake_up();
        }
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                log::error!("repeater reader panicked");
            }
        }
        self.repeater.lock().last = None;
    }

    fn read(&mut self) -> PipelineResult<Option<AccessUnit>> {
        let repeater = self.repeater.clone();
        let mut shared = repeater.lock();

        // nothing to repeat until the first frame arrives
        while shared.last.is_none() && !shared.eos && !shared.stopping {
            shared = repeater
                .cond
                .wait(shared)
                .unwrap_or_else(|e| e.into_inner());
        }
        if shared.eos || shared.stopping {
            return Ok(None);
        }

        let start = *shared.start.get_or_insert_with(Instant::now);
        loop {
            if shared.woken {
                shared.woken = false;
                break;
            }
            if shared.stopping {
                return Ok(None);
            }
            let due = start
                + Duration::from_secs_f64(shared.frame_count as f64 / shared.rate_hz.max(f64::EPSILON));
            let now = Instant::now();
            if now >= due {
                break;
            }
            shared = repeater
                .cond
                .wait_timeout(shared, due - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        shared.frame_count += 1;
        let Some(last) = shared.last.as_ref() else {
            return Ok(None);
        };
        Ok(Some(
            AccessUnit::new(last.data().clone(), now_us()).with_flags(last.flags()),
        ))
    }

    fn control(&self) -> Option<Arc<dyn SourceControl>> {
        Some(Arc::new(RepeaterControl {
            repeater: self.repeater.clone(),
            inner: self.inner_control.clone(),
        }))
    }
}

impl Drop for RepeaterSource {
    fn drop(&mut self) {
        if self.reader.is_some() {
            self.stop();
        }
    }
}

struct RepeaterControl {
    repeater: Arc<Repeater>,
    inner: Option<Arc<dyn SourceControl>>,
}

impl SourceControl for RepeaterControl {
    fn wake_up(&self) {
        self.repeater.lock().woken = true;
        self.repeater.cond.notify_all();
    }

    fn set_rotation(&self, degrees: i32) {
        if let Some(inner) = &self.inner {
            inner.set_rotation(degrees);
        }
    }

    fn frame_rate(&self) -> Option<f64> {
        Some(self.repeater.lock().rate_hz)
    }

    fn set_frame_rate(&self, rate: f64) {
        let mut shared = self.repeater.lock();
        log::info!("repeater frame rate {} -> {} Hz", shared.rate_hz, rate);
        // re-anchor on the last emitted frame so the next one is 1/rate after it
        if let (Some(start), Some(emitted)) = (shared.start, shared.frame_count.checked_sub(1)) {
            let last_due =
                start + Duration::from_secs_f64(emitted as f64 / shared.rate_hz.max(f64::EPSILON));
            shared.start = Some(last_due);
            shared.frame_count = 1;
        }
        shared.rate_hz = rate;
        drop(shared);
        self.repeater.cond.notify_all();
    }
}
