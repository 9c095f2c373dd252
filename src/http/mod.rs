//! HTTP facade over the frame cache
//!
//! - GET /       - status page with a live image
//! - GET /image  - latest frame as JPEG, 404 once it is older than [`STALE_AFTER`]
//! - GET /status - JSON status

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::capture::decoder;
use crate::pipeline::{FrameCache, PipelineStatus, ProcessSupervisor, STALE_AFTER};

/// HTTP server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<FrameCache>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub started: Instant,
    pub log_file: Option<PathBuf>,
}

impl AppState {
    /// `started` is when the service began, before camera setup.
    pub fn new(
        cache: Arc<FrameCache>,
        supervisor: Arc<ProcessSupervisor>,
        started: Instant,
    ) -> Self {
        Self {
            cache,
            supervisor,
            started,
            log_file: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    /// Seconds since the service started
    pub uptime: f64,
    /// Seconds since the cached frame was captured
    pub frame_age: Option<f64>,
    pub frame_available: bool,
    pub frame_fresh: bool,
    pub frames_published: u64,
    pub pipeline_running: bool,
    pub pipeline: PipelineStatus,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/image", get(image_handler))
        .route("/status", get(status_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn image_handler(State(state): State<AppState>) -> Response {
    let Some(cached) = state.cache.fresh_snapshot(Instant::now(), STALE_AFTER) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let encoded = tokio::task::spawn_blocking(move || {
        let meta = cached.frame.meta;
        decoder::encode_jpeg(&cached.frame.data, meta.width, meta.height)
    })
    .await;

    match encoded {
        Ok(Ok(jpeg)) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Ok(Err(e)) => {
            warn!("JPEG encode failed: {}", e);
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            warn!("JPEG encode task failed: {}", e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    Json(status_body(&state, Instant::now()))
}

pub fn status_body(state: &AppState, now: Instant) -> StatusBody {
    let cached = state.cache.snapshot();
    let pipeline = state.supervisor.status();
    StatusBody {
        uptime: now.saturating_duration_since(state.started).as_secs_f64(),
        frame_age: cached.as_ref().map(|c| c.age(now).as_secs_f64()),
        frame_available: cached.is_some(),
        frame_fresh: cached.as_ref().is_some_and(|c| c.is_fresh(now, STALE_AFTER)),
        frames_published: state.cache.published(),
        pipeline_running: pipeline.is_running(),
        pipeline,
    }
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let status = if state.supervisor.status().is_running() {
        "Running"
    } else {
        "Stopped"
    };
    let logs = state
        .log_file
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "unknown".into());

    Html(format!(
        r#"<!doctype html>
<html>
<head><title>Webcam Service</title></head>
<body>
<h1>Webcam Service</h1>
<ul>
    <li><strong>Status:</strong> {status}</li>
    <li><strong>Image Endpoint:</strong> /image</li>
    <li><strong>Status Endpoint:</strong> /status</li>
    <li><strong>Logs:</strong> {logs}</li>
</ul>
<p><a href="/image">View Current Image</a></p>

<h2>Live Image</h2>
<img id="liveImage" src="/image" alt="Live Image" width="720">

<script>
    function refreshImage() {{
        var img = document.getElementById('liveImage');
        img.src = '/image?' + new Date().getTime();
    }}
    setInterval(refreshImage, 100);
</script>
</body>
</html>
"#
    ))
}
