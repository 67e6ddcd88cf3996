use std::{
    sync::{
        Arc,
        mpsc::{Receiver, RecvTimeoutError, Sender},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    access_unit::AccessUnit,
    error::{PipelineError, PipelineResult},
    format::MediaKind,
    message::Notify,
};

/// Control surface of a source shared with the session while the source
/// itself lives on the puller's worker.
pub trait SourceControl: Send + Sync {
    /// Unblocks a pending `read`.
    fn wake_up(&self);

    fn set_rotation(&self, _degrees: i32) {}

    /// Current output frame rate, if the source can pace itself.
    fn frame_rate(&self) -> Option<f64> {
        None
    }

    fn set_frame_rate(&self, _rate: f64) {}
}

/// Producer of raw access units.
pub trait MediaSource: Send {
    fn start(&mut self) -> PipelineResult<()>;

    fn stop(&mut self);

    fn pause(&mut self) {}

    fn resume(&mut self) {}

    /// Blocks until the next access unit; `Ok(None)` is end of stream.
    fn read(&mut self) -> PipelineResult<Option<AccessUnit>>;

    fn control(&self) -> Option<Arc<dyn SourceControl>> {
        None
    }
}

#[derive(Debug)]
pub enum PullerEvent {
    AccessUnit(AccessUnit),
    Eos,
}

enum PullerCommand {
    Start {
        result: tokio::sync::oneshot::Sender<PipelineResult<()>>,
    },
    Stop,
    Pause,
    Resume,
}

/// Drives a `MediaSource` on its own blocking worker and posts what it reads.
pub struct MediaPuller {
    kind: MediaKind,
    cancel: CancellationToken,
    tx: Sender<PullerCommand>,
    control: Option<Arc<dyn SourceControl>>,
}

impl MediaPuller {
    /// `output` receives access units, `stopped` fires once after the source
    /// has been stopped.
    pub fn new(
        kind: MediaKind,
        source: Box<dyn MediaSource>,
        output: Notify<PullerEvent>,
        stopped: Notify<()>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let control = source.control();

        let cancel_clone = cancel.clone();
        tokio::task::spawn_blocking(move || {
            Self::pull_loop(kind, source, cancel_clone, rx, output, stopped)
        });

        Self {
            kind,
            cancel,
            tx,
            control,
        }
    }

    fn pull_loop(
        kind: MediaKind,
        mut source: Box<dyn MediaSource>,
        cancel: CancellationToken,
        rx: Receiver<PullerCommand>,
        output: Notify<PullerEvent>,
        stopped: Notify<()>,
    ) {
        /// Wait for commands while there is nothing to read.
        const IDLE_POLL: Duration = Duration::from_millis(10);

        let mut started = false;
        let mut paused = false;
        let mut eos = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let reading = started && !paused && !eos;
            let cmd = if reading {
                rx.try_recv().ok()
            } else {
                match rx.recv_timeout(IDLE_POLL) {
                    Ok(cmd) => Some(cmd),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            };

            match cmd {
                Some(PullerCommand::Start { result }) => {
                    let res = if started {
                        Ok(())
                    } else {
                        source.start()
                    };
                    match &res {
                        Ok(()) => {
                            log::info!("{} source started", kind);
                            started = true;
                        }
                        Err(e) => log::error!("{} source failed to start: {}", kind, e),
                    }
                    let _ = result.send(res);
                    continue;
                }
                Some(PullerCommand::Stop) => break,
                Some(PullerCommand::Pause) => {
                    if started && !paused {
                        source.pause();
                    }
                    paused = true;
                    continue;
                }
                Some(PullerCommand::Resume) => {
                    if started && paused {
                        source.resume();
                    }
                    paused = false;
                    continue;
                }
                None => (),
            }

            if !reading {
                continue;
            }

            match source.read() {
                Ok(Some(access_unit)) => {
                    if !output.post(PullerEvent::AccessUnit(access_unit)) {
                        log::debug!("{} puller output is gone", kind);
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("{} source reached end of stream", kind);
                    eos = true;
                    output.post(PullerEvent::Eos);
                }
                Err(e) => {
                    log::error!("error reading from {} source: {}", kind, e);
                    eos = true;
                    output.post(PullerEvent::Eos);
                }
            }
        }

        if started {
            source.stop();
        }
        log::info!("{} puller stopped", kind);
        stopped.post(());
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn control(&self) -> Option<Arc<dyn SourceControl>> {
        self.control.clone()
    }

    pub async fn start(&self) -> PipelineResult<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.tx
            .send(PullerCommand::Start { result: tx })
            .map_err(|_| PipelineError::ActorGone("puller"))?;
        rx.await.map_err(|_| PipelineError::ActorGone("puller"))?
    }

    /// Stops the source; the `stopped` notification follows.
    pub fn stop_async(&self) {
        self.post(PullerCommand::Stop);
        self.wake_up();
    }

    pub fn pause(&self) {
        self.post(PullerCommand::Pause);
    }

    pub fn resume(&self) {
        self.post(PullerCommand::Resume);
    }

    pub fn wake_up(&self) {
        if let Some(control) = &self.control {
            control.wake_up();
        }
    }

    fn post(&self, cmd: PullerCommand) {
        if self.tx.send(cmd).is_err() {
            log::debug!("{} puller is gone", self.kind);
        }
    }
}

impl Drop for MediaPuller {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.wake_up();
    }
}
