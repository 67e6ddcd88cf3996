use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mirror_pipeline::{PipelineError, PlaybackSession, SessionStatus};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub type ApiResult<T> = Result<T, ApiError>;

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("ApiError: {:?}", self.0);
        let status = match self.0.downcast_ref::<PipelineError>() {
            Some(PipelineError::InvalidState { .. }) => StatusCode::CONFLICT,
            Some(PipelineError::SessionDead) | Some(PipelineError::ActorGone(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub(crate) fn router(session: Arc<PlaybackSession>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/play", post(play))
        .route("/pause", post(pause))
        .route("/idr", post(request_idr))
        .route("/rotation/{degree}", post(set_rotation))
        .route("/destroy", post(destroy))
        .with_state(session)
}

pub(crate) fn start_api_server(bind: SocketAddr, session: Arc<PlaybackSession>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let app = router(session);

        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Error binding API server to {}: {}", bind, e);
                return;
            }
        };
        log::info!("API server started on {}", bind);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {
            log::info!("Shutting down API server...");
        }
    }
}

async fn status(State(session): State<Arc<PlaybackSession>>) -> ApiResult<Json<SessionStatus>> {
    Ok(Json(session.status().await?))
}

async fn play(State(session): State<Arc<PlaybackSession>>) -> ApiResult<&'static str> {
    session.play().await?;
    Ok("playing")
}

async fn pause(State(session): State<Arc<PlaybackSession>>) -> ApiResult<&'static str> {
    session.pause().await?;
    Ok("paused")
}

async fn request_idr(State(session): State<Arc<PlaybackSession>>) -> &'static str {
    session.request_idr_frame();
    "requested"
}

async fn set_rotation(
    State(session): State<Arc<PlaybackSession>>,
    Path(degree): Path<i32>,
) -> Result<&'static str, (StatusCode, String)> {
    if degree.rem_euclid(90) != 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("rotation must be a multiple of 90, got {}", degree),
        ));
    }
    session.set_video_rotation(degree);
    Ok("rotated")
}

async fn destroy(State(session): State<Arc<PlaybackSession>>) -> &'static str {
    session.destroy_async();
    "destroying"
}
