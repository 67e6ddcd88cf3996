use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::{
    access_unit::AccessUnit,
    converter::{Converter, ConverterStatsSnapshot},
    error::PipelineResult,
    format::{MediaFormat, MediaKind},
    message::Notify,
    puller::{MediaPuller, SourceControl},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Created,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackStatus {
    pub index: usize,
    pub kind: MediaKind,
    pub state: TrackState,
    pub passthrough: bool,
    pub queued_outputs: usize,
    pub suspended: bool,
    pub converter: Option<ConverterStatsSnapshot>,
}

/// One media stream of a session: an encoded puller and converter pair, or
/// a passthrough stream of already encoded samples.
///
/// Owned by the session task. `stopped` fires once after both the puller and
/// the converter have finished.
pub struct Track {
    index: usize,
    kind: MediaKind,
    format: MediaFormat,
    state: TrackState,
    paused: bool,

    puller: Option<MediaPuller>,
    converter: Option<Converter>,
    sender_track_index: Option<usize>,

    input_queue: VecDeque<AccessUnit>,
    output_queue: VecDeque<AccessUnit>,
    last_output_queued: Option<Instant>,
    idle_suspend: Duration,

    puller_stopped: bool,
    converter_shut_down: bool,
    stopped: Notify<()>,
}

impl Track {
    pub fn new_encoded(
        index: usize,
        converter: Converter,
        puller: Option<MediaPuller>,
        idle_suspend: Duration,
        stopped: Notify<()>,
    ) -> Self {
        Self::new(
            index,
            converter.output_format().clone(),
            Some(converter),
            puller,
            idle_suspend,
            stopped,
        )
    }

    pub fn new_passthrough(
        index: usize,
        format: MediaFormat,
        idle_suspend: Duration,
        stopped: Notify<()>,
    ) -> Self {
        Self::new(index, format, None, None, idle_suspend, stopped)
    }

    fn new(
        index: usize,
        format: MediaFormat,
        converter: Option<Converter>,
        puller: Option<MediaPuller>,
        idle_suspend: Duration,
        stopped: Notify<()>,
    ) -> Self {
        Self {
            index,
            kind: format.kind(),
            format,
            state: TrackState::Created,
            paused: false,
            puller,
            converter,
            sender_track_index: None,
            input_queue: VecDeque::new(),
            output_queue: VecDeque::new(),
            last_output_queued: None,
            idle_suspend,
            puller_stopped: false,
            converter_shut_down: false,
            stopped,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_video(&self) -> bool {
        self.kind.is_video()
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// Format of the buffers this track hands to the transport.
    pub fn format(&self) -> &MediaFormat {
        &self.format
    }

    pub fn is_passthrough(&self) -> bool {
        self.converter.is_none()
    }

    pub fn converter(&self) -> Option<&Converter> {
        self.converter.as_ref()
    }

    pub fn source_control(&self) -> Option<Arc<dyn SourceControl>> {
        self.puller.as_ref().and_then(|puller| puller.control())
    }

    pub fn sender_track_index(&self) -> Option<usize> {
        self.sender_track_index
    }

    pub fn set_sender_track_index(&mut self, index: usize) {
        self.sender_track_index = Some(index);
    }

    pub async fn start(&mut self) -> PipelineResult<()> {
        if self.state != TrackState::Created {
            return Ok(());
        }
        if let Some(puller) = &self.puller {
            puller.start().await?;
        }
        log::info!("{} track {} started", self.kind, self.index);
        self.state = TrackState::Started;
        self.pump_input();
        Ok(())
    }

    /// Shuts the converter down and stops the puller. Completion is reported
    /// through `stopped`.
    pub fn stop_async(&mut self) {
        if matches!(self.state, TrackState::Stopping | TrackState::Stopped) {
            return;
        }
        log::info!("stopping {} track {}", self.kind, self.index);
        self.state = TrackState::Stopping;

        while let Some(mut access_unit) = self.input_queue.pop_front() {
            access_unit.release_media_buffer();
        }

        match &self.converter {
            Some(converter) => converter.shutdown_async(),
            None => self.converter_shut_down = true,
        }
        // an unstarted puller still owns an idle worker, so wait for it too
        match &self.puller {
            Some(puller) => puller.stop_async(),
            None => self.puller_stopped = true,
        }
        self.maybe_report_stopped();
    }

    pub fn on_puller_stopped(&mut self) {
        log::debug!("{} track {} puller stopped", self.kind, self.index);
        self.puller_stopped = true;
        self.maybe_report_stopped();
    }

    pub fn on_converter_shutdown(&mut self) {
        log::debug!("{} track {} converter shut down", self.kind, self.index);
        self.converter_shut_down = true;
        self.maybe_report_stopped();
    }

    fn maybe_report_stopped(&mut self) {
        if self.state != TrackState::Stopping || !self.puller_stopped || !self.converter_shut_down {
            return;
        }
        log::info!("{} track {} stopped", self.kind, self.index);
        self.state = TrackState::Stopped;
        self.stopped.post(());
    }

    pub fn pause(&mut self) {
        self.paused = true;
        if let Some(puller) = &self.puller {
            puller.pause();
        }
    }

    pub fn resume(&mut self) {
        self.paused = false;
        if let Some(puller) = &self.puller {
            puller.resume();
        }
        self.pump_input();
    }

    pub fn request_idr_frame(&self) {
        if !self.is_video() {
            return;
        }
        if let Some(puller) = &self.puller {
            // a repeating source may sit on its last frame
            puller.wake_up();
        }
        if let Some(converter) = &self.converter {
            converter.request_idr_frame();
        }
    }

    /// Inbound access units; encoded tracks feed them to the converter,
    /// passthrough tracks move them to the output queue.
    pub fn queue_access_unit(&mut self, access_unit: AccessUnit) {
        if matches!(self.state, TrackState::Stopping | TrackState::Stopped) {
            let mut access_unit = access_unit;
            access_unit.release_media_buffer();
            return;
        }
        self.input_queue.push_back(access_unit);
        self.pump_input();
    }

    pub fn dequeue_access_unit(&mut self) -> Option<AccessUnit> {
        self.input_queue.pop_front()
    }

    fn pump_input(&mut self) {
        if self.state != TrackState::Started || self.paused {
            return;
        }
        while let Some(access_unit) = self.input_queue.pop_front() {
            if let Some(converter) = &self.converter {
                converter.feed_access_unit(access_unit);
                continue;
            }
            self.queue_output_buffer(access_unit);
        }
    }

    pub fn queue_output_buffer(&mut self, access_unit: AccessUnit) {
        self.output_queue.push_back(access_unit);
        self.last_output_queued = Some(Instant::now());
    }

    pub fn dequeue_output_buffer(&mut self) -> Option<AccessUnit> {
        self.output_queue.pop_front()
    }

    /// Timestamp of the next output buffer.
    pub fn has_output_buffer(&self) -> Option<i64> {
        self.output_queue.front().map(|access_unit| access_unit.time_us())
    }

    pub fn queued_outputs(&self) -> usize {
        self.output_queue.len()
    }

    /// Nothing queued and nothing produced for longer than the idle window.
    pub fn is_suspended(&self) -> bool {
        if !self.output_queue.is_empty() {
            return false;
        }
        self.last_output_queued
            .is_some_and(|last| last.elapsed() > self.idle_suspend)
    }

    pub fn status(&self) -> TrackStatus {
        TrackStatus {
            index: self.index,
            kind: self.kind,
            state: self.state,
            passthrough: self.is_passthrough(),
            queued_outputs: self.output_queue.len(),
            suspended: self.is_suspended(),
            converter: self.converter.as_ref().map(|c| c.stats().snapshot()),
        }
    }
}

#[cfg(test)]
#[path = "track_test.rs"]
mod track_test;
