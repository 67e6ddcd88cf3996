use std::path::PathBuf;

use tokio::sync::broadcast::{self, error::TryRecvError};

use super::*;
use crate::{
    config::{AdaptiveConfig, DebugConfig},
    mock::{MockBackend, MockGate, wait_until},
    track::TrackState,
};

fn endpoint() -> Endpoint {
    Endpoint::udp("127.0.0.1", 15550)
}

fn start_session(backend: &MockBackend, config: SessionConfig) -> (PlaybackSession, broadcast::Receiver<SessionEvent>) {
    let session = PlaybackSession::new(config, Box::new(backend.clone()));
    let events = session.subscribe();
    (session, events)
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<SessionEvent> {
    Ok(tokio::time::timeout(Duration::from_secs(3), events.recv()).await??)
}

async fn established(backend: &MockBackend, config: SessionConfig) -> anyhow::Result<(PlaybackSession, broadcast::Receiver<SessionEvent>)> {
    let (session, mut events) = start_session(backend, config);
    session.init(InitParams::new(endpoint())).await?;
    assert_eq!(next_event(&mut events).await?, SessionEvent::Established);
    Ok((session, events))
}

async fn wait_for_status(
    session: &PlaybackSession,
    mut cond: impl FnMut(&SessionStatus) -> bool,
) -> anyhow::Result<SessionStatus> {
    for _ in 0..300 {
        let status = session.status().await?;
        if cond(&status) {
            return Ok(status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("session status condition not met in time")
}

async fn destroy(session: &PlaybackSession, events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<()> {
    session.destroy_async();
    loop {
        match next_event(events).await? {
            SessionEvent::Destroyed => return Ok(()),
            SessionEvent::Dead => continue,
            other => anyhow::bail!("unexpected {:?} while destroying", other),
        }
    }
}

#[tokio::test]
async fn test_init_play_and_destroy() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, mut events) = start_session(&backend, SessionConfig::default());
    assert_eq!(session.last_lifesign_us(), 0);

    session.init(InitParams::new(endpoint())).await?;
    assert_eq!(next_event(&mut events).await?, SessionEvent::Established);
    let init_lifesign = session.last_lifesign_us();
    assert!(init_lifesign > 0);

    {
        let sender = backend.sender.lock();
        assert_eq!(sender.endpoint, Some(endpoint()));
        assert_eq!(sender.tracks.len(), 2);
        assert!(sender.tracks[0].0.is_video());
        assert!(!sender.tracks[0].1.manually_prepend_sps_pps);
        assert_eq!(sender.tracks[1].0.mime, MIME_AUDIO_AAC);
    }

    session.play().await?;
    assert!(session.last_lifesign_us() >= init_lifesign);

    let sender = backend.sender.clone();
    wait_until(move || sender.sent_on(0) > 0 && sender.sent_on(1) > 0).await?;

    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Playing);
    assert_eq!(status.tracks.len(), 2);
    assert_eq!(status.video_bitrate, Some(5_000_000));
    assert_eq!(status.frame_rate, Some(30.0));

    destroy(&session, &mut events).await?;
    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Destroyed);
    assert!(status.tracks.is_empty());

    for kind in [MediaKind::Video, MediaKind::Audio] {
        let probe = backend.source(kind).ok_or_else(|| anyhow::anyhow!("no {} source", kind))?;
        assert!(probe.stopped());
        let codec = backend.codec(kind).ok_or_else(|| anyhow::anyhow!("no {} encoder", kind))?;
        assert_eq!(codec.lock().released, 1);
    }
    Ok(())
}

#[tokio::test]
async fn test_events_stream() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let session = PlaybackSession::new(SessionConfig::default(), Box::new(backend.clone()));
    let mut events = session.events();

    session.init(InitParams::new(endpoint())).await?;
    let event = tokio::time::timeout(Duration::from_secs(3), events.next()).await?;
    assert_eq!(event, Some(SessionEvent::Established));

    session.destroy_async();
    let event = tokio::time::timeout(Duration::from_secs(3), events.next()).await?;
    assert_eq!(event, Some(SessionEvent::Destroyed));
    Ok(())
}

#[tokio::test]
async fn test_init_rejects_invalid_requests() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, mut events) = start_session(&backend, SessionConfig::default());

    let mut params = InitParams::new(endpoint());
    params.enable_audio = false;
    params.enable_video = false;
    let err = session.init(params).await.unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));

    let err = session.play().await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { .. }));

    session.init(InitParams::new(endpoint())).await?;
    assert_eq!(next_event(&mut events).await?, SessionEvent::Established);
    let err = session.init(InitParams::new(endpoint())).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { .. }));
    Ok(())
}

#[tokio::test]
async fn test_transport_init_failure_leaves_no_tracks() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    backend.sender.lock().fail_init = true;
    let (session, _events) = start_session(&backend, SessionConfig::default());

    let err = session.init(InitParams::new(endpoint())).await.unwrap_err();
    assert!(matches!(err, PipelineError::TransportInit(_)));

    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Created);
    assert!(status.tracks.is_empty());

    // the encoders of the discarded tracks get released
    let codec = backend
        .codec(MediaKind::Video)
        .ok_or_else(|| anyhow::anyhow!("no video encoder"))?;
    wait_until(move || codec.lock().released == 1).await?;
    assert!(backend.source(MediaKind::Video).is_some_and(|p| !p.started()));
    Ok(())
}

#[tokio::test]
async fn test_missing_audio_source_is_not_fatal() -> anyhow::Result<()> {
    let backend = MockBackend {
        fail_audio_source: true,
        ..Default::default()
    };
    let (session, _events) = established(&backend, SessionConfig::default()).await?;

    let status = session.status().await?;
    assert_eq!(status.tracks.len(), 1);
    assert_eq!(status.tracks[0].kind, MediaKind::Video);
    assert_eq!(backend.sender.lock().tracks.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_pcm_audio_needs_no_encoder() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, mut events) = start_session(&backend, SessionConfig::default());
    let mut params = InitParams::new(endpoint());
    params.enable_video = false;
    params.use_pcm_audio = true;
    session.init(params).await?;
    assert_eq!(next_event(&mut events).await?, SessionEvent::Established);

    assert_eq!(backend.sender.lock().tracks[0].0.mime, MIME_AUDIO_RAW);
    assert!(backend.codec(MediaKind::Audio).is_none());

    let status = session.status().await?;
    assert_eq!(status.video_bitrate, None);
    assert!(status.adaptations.is_empty());
    destroy(&session, &mut events).await
}

#[tokio::test]
async fn test_track_start_failure_kills_session() -> anyhow::Result<()> {
    let backend = MockBackend {
        fail_video_start: true,
        ..Default::default()
    };
    let (session, mut events) = start_session(&backend, SessionConfig::default());
    session.init(InitParams::new(endpoint())).await?;
    assert_eq!(next_event(&mut events).await?, SessionEvent::Dead);

    let status = session.status().await?;
    assert!(status.dead);
    assert_eq!(status.state, SessionState::Created);
    Ok(())
}

#[tokio::test]
async fn test_network_stall_drops_one_video_frame() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, _events) = established(&backend, SessionConfig::default()).await?;
    session.play().await?;

    assert!(backend.sender.post(SenderEvent::NetworkStall { bytes_queued: 65536 }));
    let status = wait_for_status(&session, |status| {
        status
            .tracks
            .iter()
            .filter_map(|track| track.converter.as_ref())
            .any(|stats| stats.frames_dropped > 0)
    })
    .await?;

    // only the video encoder drops, and nothing else moves
    let dropped: Vec<(MediaKind, u64)> = status
        .tracks
        .iter()
        .filter_map(|track| track.converter.map(|stats| (track.kind, stats.frames_dropped)))
        .collect();
    assert!(dropped.contains(&(MediaKind::Video, 1)));
    assert!(dropped.contains(&(MediaKind::Audio, 0)));
    assert_eq!(status.video_bitrate, Some(5_000_000));
    assert!(status.adaptations.is_empty());
    let codec = backend
        .codec(MediaKind::Video)
        .ok_or_else(|| anyhow::anyhow!("no video encoder"))?;
    assert!(codec.bitrates().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_sink_feedback_adapts_bitrate_and_frame_rate() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let config = SessionConfig {
        adaptive: AdaptiveConfig::adaptive(),
        ..Default::default()
    };
    let (session, _events) = established(&backend, config).await?;
    session.play().await?;

    backend.sender.post(SenderEvent::InformSender {
        avg_latency_us: 400_000,
        max_latency_us: 650_000,
    });
    let status = wait_for_status(&session, |status| status.video_bitrate == Some(3_000_000)).await?;
    assert!(status.frame_rate.is_some_and(|rate| (rate - 27.0).abs() < 1e-9));
    assert_eq!(status.adaptations.len(), 1);
    assert_eq!(status.adaptations[0].previous_bitrate, 5_000_000);

    // healthy link: back up by 10%
    backend.sender.post(SenderEvent::InformSender {
        avg_latency_us: 20_000,
        max_latency_us: 40_000,
    });
    let status = wait_for_status(&session, |status| status.video_bitrate == Some(3_300_000)).await?;
    assert_eq!(status.adaptations.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_feedback_ignored_when_rate_control_off() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, _events) = established(&backend, SessionConfig::default()).await?;

    backend.sender.post(SenderEvent::InformSender {
        avg_latency_us: 900_000,
        max_latency_us: 900_000,
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let status = session.status().await?;
    assert_eq!(status.video_bitrate, Some(5_000_000));
    assert_eq!(status.frame_rate, Some(30.0));
    assert!(status.adaptations.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_death_is_reported_once() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, mut events) = established(&backend, SessionConfig::default()).await?;
    session.play().await?;

    backend
        .sender
        .post(SenderEvent::Error(PipelineError::Transport("reset".to_string())));
    backend.sender.lock().fail_queue = true;
    backend
        .sender
        .post(SenderEvent::Error(PipelineError::Transport("reset".to_string())));

    assert_eq!(next_event(&mut events).await?, SessionEvent::Dead);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert!(session.status().await?.dead);

    // a dead session can still be torn down
    destroy(&session, &mut events).await
}

#[tokio::test]
async fn test_pause_holds_output_until_play() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, _events) = established(&backend, SessionConfig::default()).await?;
    session.play().await?;
    let sender = backend.sender.clone();
    wait_until(move || sender.sent() > 0).await?;

    session.pause().await?;
    // repeated pause is harmless
    session.pause().await?;
    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Paused);
    assert!(status.paused);
    let audio = backend
        .source(MediaKind::Audio)
        .ok_or_else(|| anyhow::anyhow!("no audio source"))?;
    let probe = audio.clone();
    wait_until(move || probe.paused()).await?;

    let sent = backend.sender.sent();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.sender.sent(), sent);

    session.play().await?;
    let sender = backend.sender.clone();
    wait_until(move || sender.sent() > sent).await?;
    assert!(!session.status().await?.paused);
    wait_until(move || !audio.paused()).await?;
    Ok(())
}

#[tokio::test]
async fn test_idr_request_and_rotation_reach_video() -> anyhow::Result<()> {
    let backend = MockBackend::default();
    let (session, _events) = established(&backend, SessionConfig::default()).await?;

    session.request_idr_frame();
    session.set_video_rotation(90);

    let video_codec = backend
        .codec(MediaKind::Video)
        .ok_or_else(|| anyhow::anyhow!("no video encoder"))?;
    let probe = video_codec.clone();
    wait_until(move || probe.lock().idr_requests == 1).await?;

    let video = backend
        .source(MediaKind::Video)
        .ok_or_else(|| anyhow::anyhow!("no video source"))?;
    wait_until(move || video.rotation() == 90).await?;

    let audio_codec = backend
        .codec(MediaKind::Audio)
        .ok_or_else(|| anyhow::anyhow!("no audio encoder"))?;
    assert_eq!(audio_codec.lock().idr_requests, 0);
    Ok(())
}

#[tokio::test]
async fn test_destroy_waits_for_pending_sends() -> anyhow::Result<()> {
    let mut backend = MockBackend::default();
    backend.codec.zero_copy = true;
    backend.sender.lock().hold_buffers = true;
    let (session, mut events) = established(&backend, SessionConfig::default()).await?;
    session.play().await?;
    let sender = backend.sender.clone();
    wait_until(move || sender.sent_on(0) > 0 && sender.sent_on(1) > 0).await?;

    session.destroy_async();
    // encoders hold on to their buffers until the transport lets go
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv()).await.is_err());
    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Destroying);
    assert!(status.pending_sends > 0);

    for _ in 0..100 {
        backend.sender.release_held();
        match tokio::time::timeout(Duration::from_millis(50), events.recv()).await {
            Ok(event) => {
                assert_eq!(event?, SessionEvent::Destroyed);
                assert_eq!(backend.sender.lock().held.len(), 0);
                assert_eq!(session.status().await?.state, SessionState::Destroyed);
                return Ok(());
            }
            Err(_) => continue,
        }
    }
    anyhow::bail!("session never finished destroying")
}

#[tokio::test]
async fn test_destroy_waits_for_last_track_to_stop() -> anyhow::Result<()> {
    let gate = MockGate::default();
    let backend = MockBackend {
        audio_stop_gate: Some(gate.clone()),
        ..Default::default()
    };
    let (session, mut events) = established(&backend, SessionConfig::default()).await?;
    session.play().await?;
    let sender = backend.sender.clone();
    wait_until(move || sender.sent_on(0) > 0 && sender.sent_on(1) > 0).await?;

    session.destroy_async();
    // video is gone while audio is stuck in its source's stop
    let status = wait_for_status(&session, |s| s.tracks.len() == 1).await?;
    assert_eq!(status.tracks[0].kind, MediaKind::Audio);
    assert_eq!(status.tracks[0].state, TrackState::Stopping);
    assert_eq!(status.state, SessionState::Destroying);
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv()).await.is_err());

    gate.open();
    assert_eq!(next_event(&mut events).await?, SessionEvent::Destroyed);
    assert!(tokio::time::timeout(Duration::from_millis(200), events.recv()).await.is_err());
    let status = session.status().await?;
    assert_eq!(status.state, SessionState::Destroyed);
    assert!(status.tracks.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_streams_local_file() -> anyhow::Result<()> {
    let backend = MockBackend {
        extractor: Some((
            vec![
                MediaFormat::video(1280, 720),
                MediaFormat::audio(MIME_AUDIO_AAC, 48000, 2),
            ],
            vec![(0, 0), (1, 0), (1, 21_000), (0, 33_000), (0, 66_000)],
        )),
        ..Default::default()
    };
    let config = SessionConfig {
        debug: DebugConfig {
            debug: 1,
            source: Some(PathBuf::from("/sdcard/test.mp4")),
        },
        ..Default::default()
    };
    let (session, mut events) = established(&backend, config).await?;
    session.play().await?;

    {
        let sender = backend.sender.lock();
        assert_eq!(sender.tracks.len(), 2);
        assert!(sender.tracks.iter().all(|(_, flags)| flags.manually_prepend_sps_pps));
    }
    // live capture is bypassed
    assert!(backend.source(MediaKind::Video).is_none());
    assert!(backend.codec(MediaKind::Video).is_none());

    let sender = backend.sender.clone();
    wait_until(move || sender.sent() == 5).await?;
    assert_eq!(backend.sender.sent_on(0), 3);
    assert_eq!(backend.sender.sent_on(1), 2);

    let status = session.status().await?;
    assert!(status.tracks.iter().all(|track| track.passthrough));

    destroy(&session, &mut events).await
}
