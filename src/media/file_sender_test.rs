use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use mirror_pipeline::{ReleaseHandle, format::MIME_AUDIO_RAW};
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("mirror-source-{}-{}", name, std::process::id()))
}

fn notify() -> (Notify<SenderEvent>, UnboundedReceiver<SenderEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (Notify::from_unbounded(tx, |e| e), rx)
}

#[test]
fn test_writes_tracks_to_files() -> anyhow::Result<()> {
    let dir = temp_dir("tracks");
    let mut sender = FileSender::new(&dir);
    let video = sender.add_track(&MediaFormat::video(640, 480), TrackFlags::default())?;
    let audio = sender.add_track(
        &MediaFormat::audio(MIME_AUDIO_RAW, 48000, 2),
        TrackFlags::default(),
    )?;
    assert_eq!((video, audio), (0, 1));

    let (notify, mut rx) = notify();
    sender.init_async(&Endpoint::udp("127.0.0.1", 15550), notify)?;
    assert_eq!(rx.try_recv()?, SenderEvent::InitDone(Ok(())));

    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let now = now_us();
    sender.queue_access_unit(
        video,
        AccessUnit::new(vec![0, 0, 0, 1, 0x65, 1], now).with_release(ReleaseHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })),
    )?;
    sender.queue_access_unit(video, AccessUnit::new(vec![0, 0, 0, 1, 0x41, 2], now))?;
    sender.queue_access_unit(audio, AccessUnit::new(vec![7; 8], now))?;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(sender.pending_sends(), 0);
    drop(sender);

    let h264 = std::fs::read(dir.join("track0-video.h264"))?;
    assert_eq!(h264, vec![0, 0, 0, 1, 0x65, 1, 0, 0, 0, 1, 0x41, 2]);
    let lpcm = std::fs::read(dir.join("track1-audio.lpcm"))?;
    assert_eq!(lpcm, vec![7; 8]);

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_queue_before_init_fails() -> anyhow::Result<()> {
    let mut sender = FileSender::new(temp_dir("uninit"));
    let track = sender.add_track(&MediaFormat::video(640, 480), TrackFlags::default())?;
    assert!(matches!(
        sender.queue_access_unit(track, AccessUnit::new(vec![1], 0)),
        Err(PipelineError::Transport(_))
    ));
    assert!(matches!(
        sender.queue_access_unit(5, AccessUnit::new(vec![1], 0)),
        Err(PipelineError::Transport(_))
    ));
    Ok(())
}

#[test]
fn test_init_failure_is_reported() -> anyhow::Result<()> {
    // a regular file where the directory should go
    let blocker = temp_dir("blocker");
    std::fs::write(&blocker, b"x")?;
    let mut sender = FileSender::new(&blocker);
    sender.add_track(&MediaFormat::video(640, 480), TrackFlags::default())?;

    let (notify, mut rx) = notify();
    sender.init_async(&Endpoint::udp("127.0.0.1", 15550), notify)?;
    assert!(matches!(
        rx.try_recv()?,
        SenderEvent::InitDone(Err(PipelineError::TransportInit(_)))
    ));

    std::fs::remove_file(&blocker)?;
    Ok(())
}

#[test]
fn test_latency_window() {
    let mut window = LatencyWindow::default();
    assert_eq!(window.add(0, 10_000), None);
    assert_eq!(window.add(500_000, 30_000), None);
    assert_eq!(window.add(1_000_000, 20_000), Some((20_000, 30_000)));
    // a fresh window starts
    assert_eq!(window.add(1_100_000, 5_000), None);
    assert_eq!(window.add(2_100_000, 7_000), Some((6_000, 7_000)));
}
