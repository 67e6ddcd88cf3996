use super::*;

#[test]
fn test_pattern_frame_layout() -> anyhow::Result<()> {
    let mut source = TestPatternSource::new(64, 36, 100);
    source.start()?;

    let first = source.read()?.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(first.len(), 64 * 36 + 2 * 32 * 18);
    // bar at the left edge, chroma neutral
    assert_eq!(first.data()[0], 235);
    assert_ne!(first.data()[BAR_WIDTH], 235);
    assert!(first.data()[64 * 36..].iter().all(|&c| c == 128));

    let second = source.read()?.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    assert_eq!(second.data()[0], 16);
    assert_eq!(second.data()[BAR_STEP], 235);
    assert!(second.time_us() >= first.time_us());
    Ok(())
}

#[test]
fn test_pattern_follows_rotation() -> anyhow::Result<()> {
    let mut source = TestPatternSource::new(32, 32, 100);
    let control = source.control().ok_or_else(|| anyhow::anyhow!("no control"))?;
    source.start()?;
    control.set_rotation(90);

    let frame = source.read()?.ok_or_else(|| anyhow::anyhow!("no frame"))?;
    // bar spans the first rows
    assert!(frame.data()[..32].iter().all(|&l| l == 235));
    assert_ne!(frame.data()[32 * BAR_WIDTH + 1], 235);
    Ok(())
}

#[test]
fn test_empty_size_rejected() {
    let mut source = TestPatternSource::new(0, 720, 30);
    assert!(matches!(source.start(), Err(PipelineError::Start(_))));
}

#[test]
fn test_wake_up_cuts_wait_short() -> anyhow::Result<()> {
    // one frame per second
    let mut source = TestPatternSource::new(16, 16, 1);
    let control = source.control().ok_or_else(|| anyhow::anyhow!("no control"))?;
    source.start()?;
    source.read()?;

    let started = Instant::now();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        control.wake_up();
    });
    assert!(source.read()?.is_some());
    assert!(started.elapsed() < Duration::from_millis(500));
    waker.join().map_err(|_| anyhow::anyhow!("waker panicked"))?;
    Ok(())
}

#[test]
fn test_stop_ends_stream() -> anyhow::Result<()> {
    let mut source = ToneSource::new();
    source.start()?;
    source.stop();
    assert!(source.read()?.is_none());
    Ok(())
}

#[test]
fn test_tone_chunks() -> anyhow::Result<()> {
    let mut source = ToneSource::new();
    source.start()?;
    let chunk = source.read()?.ok_or_else(|| anyhow::anyhow!("no chunk"))?;
    assert_eq!(chunk.len(), TONE_CHUNK_FRAMES * FRAME_SIZE);
    assert!(!mirror_pipeline::pcm::is_silence(chunk.data()));

    // both channels carry the same sample
    let data = chunk.data();
    for frame in data.chunks(FRAME_SIZE).take(20) {
        assert_eq!(frame[..2], frame[2..]);
    }

    // phase carries over between chunks
    let next = source.read()?.ok_or_else(|| anyhow::anyhow!("no chunk"))?;
    assert_ne!(next.data(), chunk.data());
    Ok(())
}
