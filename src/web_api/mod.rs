//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - HTTP API routes (detector control, frames, slot summary, detection ingest)
//! - WebSocket endpoint for the realtime hub
//! - Response formatting

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let detector_ok = match &state.detector {
        Some(detector) => detector.health_check().await.unwrap_or(false),
        None => false,
    };

    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        active_workers: state.registry.len(),
        detector_connected: detector_ok,
    };

    Json(response)
}
