//! Health and metrics listeners.
//!
//! Two dedicated ports: health probes for the kubelet (liveness,
//! readiness, startup) and the Prometheus scrape endpoint. Failure to
//! bind either is a fatal initialization error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::Metrics;

/// Shared readiness flag flipped once controllers are running.
#[derive(Clone, Default)]
pub struct Health {
    ready: Arc<AtomicBool>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        info!("operator marked ready");
    }

    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

pub async fn run_health(port: u16, health: Health) -> Result<()> {
    let app = Router::new()
        .route("/health", get(live))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .route("/startup", get(startup))
        .with_state(health)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding health listener to {addr}"))?;
    info!(addr = %addr, "health listener started");
    axum::serve(listener, app).await.context("health server error")
}

pub async fn run_metrics(port: u16, metrics: Metrics) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(scrape))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding metrics listener to {addr}"))?;
    info!(addr = %addr, "metrics listener started");
    axum::serve(listener, app).await.context("metrics server error")
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({"status": "alive"}))
}

async fn startup() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(health): State<Health>) -> (StatusCode, Json<serde_json::Value>) {
    if health.is_ready() {
        (StatusCode::OK, Json(json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready", "reason": "operator initializing"})),
        )
    }
}

async fn scrape(State(metrics): State<Metrics>) -> String {
    metrics.render()
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
