//! Health probe and metrics endpoints

use crate::server::metrics::SharedMetrics;
use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared readiness flag
///
/// Set once the controller is initialized and connected; cleared during
/// shutdown so Kubernetes stops routing to the pod.
#[derive(Debug, Clone, Default)]
pub struct ReadinessState {
    ready: Arc<std::sync::atomic::AtomicBool>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Parse a bind address like ":8080", "0.0.0.0:9090" or "8081"
///
/// A leading colon (controller-manager convention) binds all interfaces.
pub fn parse_bind_address(value: &str) -> Option<SocketAddr> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let candidate = if let Some(port) = value.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else if value.contains(':') {
        value.to_string()
    } else {
        format!("0.0.0.0:{}", value)
    };
    candidate.parse().ok()
}

#[derive(Clone)]
struct ServerState {
    readiness: ReadinessState,
    metrics: Option<SharedMetrics>,
}

/// Liveness: if this responds, the process is alive
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Readiness: 200 once initialized, 503 otherwise
async fn readyz(State(state): State<ServerState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus text-format metrics
async fn metrics(State(state): State<ServerState>) -> impl IntoResponse {
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

fn build_router(readiness: ReadinessState, metrics: Option<SharedMetrics>) -> Router {
    let state = ServerState { readiness, metrics };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz));
    if state.metrics.is_some() {
        router = router.route("/metrics", get(self::metrics));
    }
    router.with_state(state)
}

/// Serve health probes, optionally with `/metrics` on the same listener
pub async fn run_health_server(
    addr: SocketAddr,
    readiness: ReadinessState,
    metrics: Option<SharedMetrics>,
) -> std::io::Result<()> {
    let router = build_router(readiness, metrics);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Health server listening");
    axum::serve(listener, router).await
}

/// Serve `/metrics` on its own listener when the bind addresses differ
pub async fn run_metrics_server(addr: SocketAddr, metrics: SharedMetrics) -> std::io::Result<()> {
    let state = ServerState {
        readiness: ReadinessState::new(),
        metrics: Some(metrics),
    };
    let router = Router::new()
        .route("/metrics", get(self::metrics))
        .with_state(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Metrics server listening");
    axum::serve(listener, router).await
}
