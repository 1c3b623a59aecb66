use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::ReconfigError;
use crate::pipeline::session::STREAM_CONTENT_TYPE;
use crate::pipeline::{CaptureState, StreamSession};

/// Parts buffered between a session and its connection
const STREAM_CHANNEL_DEPTH: usize = 2;

const INDEX_PAGE: &str = r#"<html>
<head>
<title>zerocam</title>
</head>
<body>
<h1>zerocam live stream</h1>
<img src="stream.mjpg" />
</body>
</html>
"#;

impl IntoResponse for ReconfigError {
    fn into_response(self) -> Response {
        let status = match self {
            ReconfigError::InvalidResolution(_) => StatusCode::BAD_REQUEST,
            ReconfigError::InProgress => StatusCode::CONFLICT,
            ReconfigError::Device(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, &self.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn invalid_json() -> Response {
    error_response(StatusCode::BAD_REQUEST, "Invalid JSON")
}

fn no_frames() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "No frames available")
}

pub(super) async fn root() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/stream.mjpg")],
    )
        .into_response()
}

pub(super) async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Open an MJPEG stream backed by its own session task
pub(super) async fn stream(State(state): State<AppState>) -> Response {
    if state.coordinator.status().state == CaptureState::Stopped {
        return no_frames();
    }

    let session = StreamSession::new(state.coordinator.bus().clone(), state.policy);
    let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_DEPTH);
    info!(session = session.id(), "Streaming client connected");
    tokio::spawn(session.run(tx));

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::AGE, "0"),
            (header::CACHE_CONTROL, "no-cache, private"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

pub(super) async fn snapshot(State(state): State<AppState>) -> Response {
    match state.coordinator.bus().latest() {
        Some(frame) => ([(header::CONTENT_TYPE, "image/jpeg")], frame.data).into_response(),
        None => no_frames(),
    }
}

pub(super) async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.coordinator.status();
    let bus = state.coordinator.bus();
    let stats = bus.stats();

    Json(json!({
        "state": status.state,
        "resolution": status.resolution,
        "last_error": status.last_error,
        "sequence": bus.sequence(),
        "waiters": bus.waiters(),
        "published": stats.published,
        "rejected": stats.rejected,
    }))
}

/// `{"resolution": "480p" | "720p" | "1080p"}`
pub(super) async fn change_resolution(State(state): State<AppState>, body: Bytes) -> Response {
    let Ok(request) = serde_json::from_slice::<Value>(&body) else {
        debug!("Rejecting resolution change with malformed body");
        return invalid_json();
    };

    // A missing or non-string value is reported like any unsupported resolution
    let requested = match request.get("resolution") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    info!(requested = %requested, "Resolution change requested");

    match state.coordinator.request_resolution(&requested).await {
        Ok(resolution) => Json(json!({
            "message": format!("Changing resolution to {resolution}")
        }))
        .into_response(),
        Err(e) => {
            warn!("Resolution change refused: {}", e);
            e.into_response()
        }
    }
}

/// Echo endpoint kept for client compatibility; nothing is stored
pub(super) async fn upload(body: Bytes) -> Response {
    match serde_json::from_slice::<Value>(&body) {
        Ok(data) => {
            debug!(bytes = body.len(), "Upload received");
            (
                StatusCode::CREATED,
                Json(json!({ "message": "Upload successful", "data": data })),
            )
                .into_response()
        }
        Err(_) => invalid_json(),
    }
}

pub(super) async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Endpoint not found")
}
