//! HTTP surface: snapshot, MJPEG stream and health over axum

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream;
use tokio::net::TcpListener;
use tracing::info;

use crate::pipeline::CaptureStatus;
use crate::serve::snapshot::SnapshotProvider;
use crate::serve::stream::{self as mjpeg, StreamDistributor};
use crate::shutdown::ShutdownSignal;

const FRAME_SEQUENCE: HeaderName = HeaderName::from_static("x-frame-sequence");
const STREAM_CLIENTS: HeaderName = HeaderName::from_static("x-stream-clients");

const INDEX_HTML: &str = r#"<!doctype html>
<html>
  <head><title>framecast</title><meta name="viewport" content="width=device-width, initial-scale=1"></head>
  <body style="margin:0;background:#111;color:#eee;font-family:sans-serif;">
    <div style="max-width:900px;margin:1rem auto;padding:0 1rem;">
      <h2>Live</h2>
      <img src="/mjpeg" style="width:100%;height:auto;display:block;border-radius:8px" />
      <p><a href="/snapshot.jpg" style="color:#8cf">Snapshot</a> &middot; <a href="/health" style="color:#8cf">Health</a></p>
    </div>
  </body>
</html>
"#;

/// State shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub snapshots: SnapshotProvider,
    pub distributor: StreamDistributor,
    pub status: CaptureStatus,
    pub shutdown: ShutdownSignal,
    pub snapshot_wait: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/snapshot.jpg", get(snapshot))
        .route("/mjpeg", get(live_stream))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve until the shutdown signal fires
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let listener = TcpListener::bind(addr).await?;
    info!("Serving on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn snapshot(State(state): State<AppState>) -> Response {
    match state.snapshots.wait_for_snapshot(state.snapshot_wait).await {
        Ok(frame) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
                (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                (FRAME_SEQUENCE, HeaderValue::from(frame.sequence())),
            ],
            frame.data.clone(),
        )
            .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

async fn live_stream(State(state): State<AppState>) -> Response {
    let parts = state.distributor.open_session(state.shutdown.clone());
    let body = Body::from_stream(stream::unfold(parts, |mut parts| async move {
        parts
            .recv()
            .await
            .map(|part| (Ok::<_, Infallible>(part), parts))
    }));

    (
        [
            (header::CONTENT_TYPE, mjpeg::CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// 200 while streaming, 503 otherwise; the body is the capture state
async fn health(State(state): State<AppState>) -> Response {
    let current = state.status.current();
    let code = if current.is_streaming() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let clients = state.distributor.stats().clients;
    (
        code,
        [(STREAM_CLIENTS, HeaderValue::from(clients))],
        current.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::EncodedFrame;
    use crate::pipeline::{frame_slot, CaptureState, FramePublisher};
    use crate::shutdown::Shutdown;
    use crate::StreamConfig;
    use axum::body::to_bytes;
    use axum::http::Request;
    use bytes::Bytes;
    use std::time::SystemTime;
    use tower::ServiceExt;

    fn app() -> (FramePublisher, AppState, Shutdown) {
        let (publisher, slot) = frame_slot();
        let shutdown = Shutdown::new();
        let state = AppState {
            snapshots: SnapshotProvider::new(slot.clone()),
            distributor: StreamDistributor::new(slot, &StreamConfig::default()),
            status: CaptureStatus::new(),
            shutdown: shutdown.signal(),
            snapshot_wait: Duration::ZERO,
        };
        (publisher, state, shutdown)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn snapshot_is_503_until_a_frame_exists() {
        let (mut publisher, state, _shutdown) = app();

        let response = router(state.clone())
            .oneshot(get_request("/snapshot.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        publisher.publish(EncodedFrame {
            jpeg: Bytes::from_static(b"\xFF\xD8jpeg"),
            width: 1,
            height: 1,
            captured_at: SystemTime::now(),
            device_timestamp: None,
        });

        let response = router(state)
            .oneshot(get_request("/snapshot.jpg"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()["x-frame-sequence"], "1");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"\xFF\xD8jpeg");
    }

    #[tokio::test]
    async fn health_follows_capture_state() {
        let (_publisher, state, _shutdown) = app();

        let response = router(state.clone())
            .oneshot(get_request("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.status.set(CaptureState::Streaming);
        let response = router(state.clone())
            .oneshot(get_request("/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-stream-clients"], "0");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"streaming");

        state.status.set(CaptureState::Failed("unplugged".into()));
        let response = router(state).oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn mjpeg_is_a_multipart_stream() {
        let (_publisher, state, shutdown) = app();

        let response = router(state).oneshot(get_request("/mjpeg")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        // Ends cleanly once the session is told to stop
        shutdown.trigger();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn index_embeds_the_stream() {
        let (_publisher, state, _shutdown) = app();
        let response = router(state).oneshot(get_request("/")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("src=\"/mjpeg\""));
    }
}
