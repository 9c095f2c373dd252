use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use camrelay::http::{router, status_body, AppState};
use camrelay::pipeline::{FrameCache, ProcessSupervisor, SystemHost, STALE_AFTER};
use camrelay::{Config, Frame};

fn state() -> AppState {
    let supervisor = ProcessSupervisor::new(
        Arc::new(SystemHost),
        Config::default().pipeline,
        "/dev/video0",
    );
    AppState::new(Arc::new(FrameCache::new()), Arc::new(supervisor), Instant::now())
}

fn grey_frame() -> Frame {
    Frame::rgb(1, 8, 8, vec![128u8; 8 * 8 * 3])
}

fn ago(secs: u64) -> Instant {
    Instant::now()
        .checked_sub(Duration::from_secs(secs))
        .expect("monotonic clock too young")
}

async fn get(state: AppState, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, content_type, body)
}

#[tokio::test]
async fn image_is_404_before_any_frame() {
    let (status, _, _) = get(state(), "/image").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fresh_frame_is_served_as_jpeg() {
    let state = state();
    state.cache.publish(grey_frame(), Instant::now());

    let (status, content_type, body) = get(state, "/image").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn stale_frame_is_404() {
    let state = state();
    state.cache.publish(grey_frame(), ago(6));

    let (status, _, _) = get(state, "/image").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn frame_exactly_stale_after_old_is_404() {
    let state = state();
    state.cache.publish(grey_frame(), ago(STALE_AFTER.as_secs()));

    let (status, _, _) = get(state, "/image").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_reports_frame_age_and_uptime() {
    let supervisor = ProcessSupervisor::new(
        Arc::new(SystemHost),
        Config::default().pipeline,
        "/dev/video0",
    );
    let state = AppState::new(Arc::new(FrameCache::new()), Arc::new(supervisor), ago(5));
    state.cache.publish(grey_frame(), ago(1));

    let (status, content_type, body) = get(state, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));

    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["frame_available"], true);
    assert_eq!(json["frame_fresh"], true);
    assert_eq!(json["pipeline_running"], false);
    assert_eq!(json["pipeline"]["source"], "stopped");
    let age = json["frame_age"].as_f64().unwrap();
    assert!((age - 1.0).abs() < 0.5, "frame_age = {age}");
    let uptime = json["uptime"].as_f64().unwrap();
    assert!((uptime - 5.0).abs() < 0.5, "uptime = {uptime}");
}

#[test]
fn status_without_frame_has_no_age() {
    let state = state();
    let body = status_body(&state, Instant::now());

    assert!(!body.frame_available);
    assert!(body.frame_age.is_none());
    assert_eq!(body.frames_published, 0);
}

#[tokio::test]
async fn index_links_the_image_endpoint() {
    let (status, _, body) = get(state(), "/").await;
    let html = String::from_utf8(body).unwrap();

    assert_eq!(status, StatusCode::OK);
    assert!(html.contains("Webcam Service"));
    assert!(html.contains(r#"src="/image""#));
    assert!(html.contains("Stopped"));
}
