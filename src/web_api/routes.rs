//! API routes

use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::camera_worker::WorkerStats;
use crate::capture_source::SourceDescriptor;
use crate::classifier;
use crate::error::{Error, Result};
use crate::models::{ApiResponse, CameraId, OccupancySummary, RawDetection};
use crate::state::AppState;

/// Poll period of the MJPEG stream when no new frame is available
const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(30);
const MJPEG_BOUNDARY: &str = "frame";

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Detectors
        .route("/api/detectors", get(list_detectors))
        .route("/api/detectors/stop-all", delete(stop_all_detectors))
        .route("/api/detectors/:camera_id/start", post(start_detector))
        .route("/api/detectors/:camera_id/stop", delete(stop_detector))
        .route("/api/detectors/:camera_id/status", get(detector_status))
        // Frames
        .route("/api/stream/:camera_id", get(video_stream))
        .route("/api/stream/:camera_id/snapshot", get(snapshot))
        // Slots
        .route("/api/cameras/:camera_id/slots/summary", get(slot_summary))
        // External detection ingest
        .route("/api/detections", post(ingest_detections))
        // WebSocket
        .route("/api/ws", get(ws_handler))
        .with_state(state)
}

// ========================================
// Detectors
// ========================================

/// Optional body of a start request
#[derive(Debug, Default, Deserialize)]
struct StartDetectorRequest {
    /// Overrides the camera's configured stream descriptor
    source: Option<String>,
}

#[derive(Debug, Serialize)]
struct DetectorResponse {
    camera_id: CameraId,
    status: &'static str,
    message: String,
}

async fn start_detector(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
    body: Option<Json<StartDetectorRequest>>,
) -> Result<Json<ApiResponse<DetectorResponse>>> {
    if state.registry.get(camera_id).is_some() {
        return Ok(Json(ApiResponse::success(DetectorResponse {
            camera_id,
            status: "already_running",
            message: format!("Detector for camera {} is already running", camera_id),
        })));
    }

    let override_source = body.and_then(|Json(req)| req.source);
    let source = match override_source {
        Some(source) => source,
        None => state
            .store
            .camera_source(camera_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Camera {} not found", camera_id)))?,
    };
    let descriptor = SourceDescriptor::parse(&source)?;

    state.registry.start(camera_id, descriptor)?;

    Ok(Json(ApiResponse::success(DetectorResponse {
        camera_id,
        status: "started",
        message: format!("Detector started for camera {}", camera_id),
    })))
}

async fn stop_detector(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> Result<Json<ApiResponse<DetectorResponse>>> {
    if !state.registry.stop(camera_id) {
        return Err(Error::NotFound(format!(
            "Detector for camera {} not found or not running",
            camera_id
        )));
    }

    Ok(Json(ApiResponse::success(DetectorResponse {
        camera_id,
        status: "stopped",
        message: format!("Detector stopped for camera {}", camera_id),
    })))
}

async fn stop_all_detectors(State(state): State<AppState>) -> impl IntoResponse {
    let stopped = state.registry.stop_all();
    Json(ApiResponse::success(serde_json::json!({ "stopped": stopped })))
}

async fn list_detectors(
    State(state): State<AppState>,
) -> Json<ApiResponse<BTreeMap<CameraId, WorkerStats>>> {
    Json(ApiResponse::success(state.registry.list()))
}

async fn detector_status(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> Result<Json<ApiResponse<WorkerStats>>> {
    let worker = state
        .registry
        .get(camera_id)
        .ok_or_else(|| Error::NotFound(format!("Detector for camera {} not found", camera_id)))?;
    Ok(Json(ApiResponse::success(worker.stats())))
}

// ========================================
// Frames
// ========================================

async fn snapshot(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> Result<Response> {
    let worker = state
        .registry
        .get(camera_id)
        .ok_or_else(|| Error::NotFound(format!("Detector for camera {} not found", camera_id)))?;

    let exposed = worker
        .current_frame()
        .ok_or_else(|| Error::Capture(format!("No frame captured yet for camera {}", camera_id)))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
            (
                header::HeaderName::from_static("x-frame-id"),
                exposed.frame_id.to_string(),
            ),
        ],
        exposed.frame.as_bytes().to_vec(),
    )
        .into_response())
}

/// Multipart MJPEG of the exposed frame; ends when the worker stops
async fn video_stream(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> Result<Response> {
    let worker = state.registry.get(camera_id).ok_or_else(|| {
        Error::NotFound(format!(
            "Detector for camera {} not found. Start detector first.",
            camera_id
        ))
    })?;

    let frames = futures::stream::unfold((worker, 0u64), |(worker, last_id)| async move {
        loop {
            if !worker.is_running() {
                return None;
            }
            match worker.current_frame() {
                Some(exposed) if exposed.frame_id != last_id => {
                    let bytes = exposed.frame.as_bytes();
                    let mut part = Vec::with_capacity(bytes.len() + 64);
                    let part_header =
                        format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", MJPEG_BOUNDARY);
                    part.extend_from_slice(part_header.as_bytes());
                    part.extend_from_slice(bytes);
                    part.extend_from_slice(b"\r\n");
                    return Some((Ok::<_, std::io::Error>(part), (worker, exposed.frame_id)));
                }
                _ => tokio::time::sleep(STREAM_POLL_INTERVAL).await,
            }
        }
    });

    Ok((
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", MJPEG_BOUNDARY),
        )],
        Body::from_stream(frames),
    )
        .into_response())
}

// ========================================
// Slots
// ========================================

async fn slot_summary(
    State(state): State<AppState>,
    Path(camera_id): Path<CameraId>,
) -> Result<Json<ApiResponse<OccupancySummary>>> {
    let summary = state.pipeline.summary(camera_id).await?;
    Ok(Json(ApiResponse::success(summary)))
}

// ========================================
// Detection ingest
// ========================================

/// Detections produced by an external detector
#[derive(Debug, Deserialize)]
struct IngestRequest {
    camera_id: CameraId,
    /// Frame id for client-side video sync
    frame_id: Option<u64>,
    /// Unix timestamp (seconds)
    timestamp: Option<f64>,
    detections: Vec<RawDetection>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    camera_id: CameraId,
    detections_count: usize,
    accepted: usize,
    slots_evaluated: usize,
    slots_updated: usize,
}

async fn ingest_detections(
    State(state): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<ApiResponse<IngestResponse>>)> {
    let timestamp = req
        .timestamp
        .filter(|t| t.is_finite())
        .and_then(|t| DateTime::<Utc>::from_timestamp_millis((t * 1000.0) as i64))
        .unwrap_or_else(Utc::now);

    let received = req.detections.len();
    let detections = classifier::to_detections(
        req.detections,
        req.frame_id.unwrap_or(0),
        timestamp,
        &state.config.pipeline.target_classes,
    );

    let report = state
        .pipeline
        .process_detections(req.camera_id, &detections, req.frame_id)
        .await?;

    tracing::info!(
        camera_id = req.camera_id,
        received = received,
        accepted = detections.len(),
        changed = report.changed,
        "Processed external detections"
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(IngestResponse {
            camera_id: req.camera_id,
            detections_count: received,
            accepted: detections.len(),
            slots_evaluated: report.slots_evaluated,
            slots_updated: report.changed,
        })),
    ))
}

// ========================================
// WebSocket
// ========================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut rx) = state.realtime.register().await;

    // Forward hub messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.realtime.unregister(&conn_id).await;
}
