use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use mirror_pipeline::{
    AccessUnit, Endpoint, MediaFormat, MediaSender, PipelineError, PipelineResult, SenderEvent,
    TrackFlags,
    format::MIME_AUDIO_AAC,
    message::{Notify, now_us},
};

/// Latency feedback goes out once per this many microseconds.
const FEEDBACK_INTERVAL_US: i64 = 1_000_000;

struct TrackFile {
    format: MediaFormat,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

#[derive(Debug, Default)]
struct LatencyWindow {
    start_us: Option<i64>,
    total_us: i64,
    max_us: i64,
    samples: i64,
}

impl LatencyWindow {
    /// Adds one sample; returns (avg, max) when a window completes.
    fn add(&mut self, now_us: i64, latency_us: i64) -> Option<(i64, i64)> {
        let start_us = *self.start_us.get_or_insert(now_us);
        self.total_us += latency_us;
        self.max_us = self.max_us.max(latency_us);
        self.samples += 1;

        if now_us - start_us < FEEDBACK_INTERVAL_US {
            return None;
        }
        let report = (self.total_us / self.samples, self.max_us);
        *self = Self::default();
        Some(report)
    }
}

/// Transport that writes every track's access units into its own file.
///
/// Latency is measured from the capture timestamp to the write and reported
/// back as sink feedback.
pub struct FileSender {
    dir: PathBuf,
    tracks: Vec<TrackFile>,
    notify: Option<Notify<SenderEvent>>,
    latency: LatencyWindow,
}

impl FileSender {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            tracks: Vec::new(),
            notify: None,
            latency: LatencyWindow::default(),
        }
    }

    fn open_tracks(&mut self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        for track in &mut self.tracks {
            track.writer = Some(BufWriter::new(File::create(&track.path)?));
            log::info!("track {} -> {}", track.format, track.path.display());
        }
        Ok(())
    }

    fn post(&self, event: SenderEvent) {
        if let Some(notify) = &self.notify {
            notify.post(event);
        }
    }
}

fn extension(format: &MediaFormat) -> &'static str {
    if format.is_avc() {
        "h264"
    } else if format.mime.eq_ignore_ascii_case(MIME_AUDIO_AAC) {
        "aac"
    } else if format.is_raw_audio() {
        "lpcm"
    } else {
        "bin"
    }
}

impl MediaSender for FileSender {
    fn add_track(&mut self, format: &MediaFormat, _flags: TrackFlags) -> PipelineResult<usize> {
        let index = self.tracks.len();
        let path = self
            .dir
            .join(format!("track{}-{}.{}", index, format.kind(), extension(format)));
        self.tracks.push(TrackFile {
            format: format.clone(),
            path,
            writer: None,
            written: 0,
        });
        Ok(index)
    }

    fn init_async(&mut self, endpoint: &Endpoint, notify: Notify<SenderEvent>) -> PipelineResult<()> {
        log::info!("file transport for {} writing to {}", endpoint, self.dir.display());
        self.notify = Some(notify);
        let result = self
            .open_tracks()
            .map_err(|e| PipelineError::TransportInit(format!("{}: {}", self.dir.display(), e)));
        self.post(SenderEvent::InitDone(result));
        Ok(())
    }

    fn queue_access_unit(&mut self, track_index: usize, access_unit: AccessUnit) -> PipelineResult<()> {
        let track = self
            .tracks
            .get_mut(track_index)
            .ok_or_else(|| PipelineError::Transport(format!("no track {}", track_index)))?;
        let writer = track
            .writer
            .as_mut()
            .ok_or_else(|| PipelineError::Transport("transport is not initialized".to_string()))?;

        let result = writer.write_all(access_unit.data());
        // the bytes are in the file buffer either way
        access_unit.release();
        if let Err(e) = result {
            let error = PipelineError::Transport(format!("{}: {}", track.path.display(), e));
            self.post(SenderEvent::Error(error.clone()));
            return Err(error);
        }
        track.written += access_unit.len() as u64;

        let now = now_us();
        if let Some((avg_latency_us, max_latency_us)) =
            self.latency.add(now, (now - access_unit.time_us()).max(0))
        {
            self.post(SenderEvent::InformSender {
                avg_latency_us,
                max_latency_us,
            });
        }
        Ok(())
    }

    fn pending_sends(&self) -> usize {
        0
    }
}

impl Drop for FileSender {
    fn drop(&mut self) {
        for track in &mut self.tracks {
            if let Some(mut writer) = track.writer.take() {
                if let Err(e) = writer.flush() {
                    log::warn!("flush {} failed: {}", track.path.display(), e);
                }
                log::info!("{}: {} bytes", track.path.display(), track.written);
            }
        }
    }
}

#[cfg(test)]
#[path = "file_sender_test.rs"]
mod file_sender_test;
