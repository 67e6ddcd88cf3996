use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use mirror_pipeline::{PlaybackSession, SessionEvent};
use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod media;

/// Upper bound on waiting for the session to tear down at exit.
const DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("mirror_pipeline", log::LevelFilter::Debug)
        .filter_module("mirror_source", log::LevelFilter::Debug)
        .init();
}

async fn run(cancel: CancellationToken) -> anyhow::Result<()> {
    let config = config::config();
    let session_config = config.session_config()?;
    let backend = media::LocalBackend::new(config.output_dir(), config.encoder());
    let session = Arc::new(PlaybackSession::new(session_config, Box::new(backend)));

    let mut events = session.events();
    session.init(config.init_params()).await?;
    session.play().await?;

    api::start_api_server(config.bind(), session.clone(), cancel.clone());

    let mut destroyed = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            event = events.next() => match event {
                Some(SessionEvent::Dead) => {
                    log::error!("session died, shutting down");
                    cancel.cancel();
                }
                Some(SessionEvent::Destroyed) | None => {
                    log::info!("session destroyed");
                    destroyed = true;
                    cancel.cancel();
                }
                Some(event) => log::info!("session event: {:?}", event),
            },
        }
    }

    if !destroyed {
        session.destroy_async();
        let wait = async {
            while let Some(event) = events.next().await {
                if event == SessionEvent::Destroyed {
                    break;
                }
            }
        };
        if tokio::time::timeout(DESTROY_TIMEOUT, wait).await.is_err() {
            log::warn!("session did not finish tearing down within {:?}", DESTROY_TIMEOUT);
        }
    }
    session.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    #[cfg(feature = "ffmpeg")]
    mirror_pipeline::ffmpeg::init().unwrap_or_else(|e| {
        eprintln!("Error initializing ffmpeg: {}", e);
        std::process::exit(1);
    });

    let cancel = CancellationToken::new();
    if let Err(e) = run(cancel.clone()).await {
        log::error!("mirror source failed: {:#}", e);
        cancel.cancel();
        std::process::exit(1);
    }

    std::process::exit(0);
}
