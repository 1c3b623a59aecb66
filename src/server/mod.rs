//! HTTP gateway: MJPEG stream, resolution control and small helper endpoints

mod handlers;

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::pipeline::{ReconfigCoordinator, SessionPolicy};

/// Shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ReconfigCoordinator>,
    pub policy: SessionPolicy,
}

impl AppState {
    pub fn new(coordinator: Arc<ReconfigCoordinator>, policy: SessionPolicy) -> Self {
        Self {
            coordinator,
            policy,
        }
    }
}

/// Build the gateway. Every response carries `Access-Control-Allow-Origin: *`
/// and any `OPTIONS` request is answered by the CORS layer.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(handlers::root))
        .route("/index.html", get(handlers::index))
        .route("/stream", get(handlers::stream))
        .route("/stream.mjpg", get(handlers::stream))
        .route("/snapshot.jpg", get(handlers::snapshot))
        .route("/status", get(handlers::status))
        .route("/change_resolution", post(handlers::change_resolution))
        .route("/upload", post(handlers::upload))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` resolves, then drain open connections
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("HTTP gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
