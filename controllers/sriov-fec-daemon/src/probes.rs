//! Health, readiness and metrics endpoints.
//!
//! - `/healthz`: always 200 while the process serves requests
//! - `/readyz`: 200 once the watcher finished its initial list, 503 before
//! - `/metrics`: Prometheus text format

use crate::error::ControllerError;
use crate::metrics::Metrics;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct ProbeState {
    pub metrics: Arc<Metrics>,
    pub ready: Arc<AtomicBool>,
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProbeState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve probes on `addr` until `shutdown` turns true
pub async fn serve(
    addr: SocketAddr,
    state: ProbeState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving health probes and metrics on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await?;

    info!("Probe server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ProbeState {
        ProbeState {
            metrics: Arc::new(Metrics::new().unwrap()),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_healthz() {
        assert_eq!(get_status(router(state()), "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let state = state();
        assert_eq!(
            get_status(router(state.clone()), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.ready.store(true, Ordering::SeqCst);
        assert_eq!(get_status(router(state), "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = state();
        state.metrics.record_reconcile("completed");

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("sriov_fec_reconcile_total{result=\"completed\"} 1"));
    }

    #[tokio::test]
    async fn test_unknown_path() {
        assert_eq!(get_status(router(state()), "/nope").await, StatusCode::NOT_FOUND);
    }
}
