//! Lotwatch Library
//!
//! Parking slot occupancy from camera streams.
//!
//! ## Architecture
//!
//! 1. CaptureSource - Frame acquisition (ffmpeg MJPEG pipe)
//! 2. CameraWorker - Per-camera capture loop + inference dispatch
//! 3. Classifier - Vehicle detection server adapter
//! 4. SlotMatcher - Detection to slot assignment (overlap ratio)
//! 5. StatusSmoother - Per-slot majority vote over recent cycles
//! 6. SlotReconciler - Status diff + event log entries
//! 7. SlotStore - Slot persistence (MySQL or in-memory)
//! 8. OccupancyPipeline - Match, smooth, reconcile, commit, publish
//! 9. WorkerRegistry - Active camera workers
//! 10. RealtimeHub - WebSocket distribution
//! 11. WebAPI - REST API endpoints
//!
//! ## Design Principles
//!
//! - One worker per camera, one reconciliation queue per camera
//! - Status changes are committed atomically with their events
//! - Publishing never rolls back a committed change

pub mod camera_worker;
pub mod capture_source;
pub mod classifier;
pub mod error;
pub mod geometry;
pub mod models;
pub mod occupancy_pipeline;
pub mod realtime_hub;
pub mod slot_matcher;
pub mod slot_reconciler;
pub mod slot_store;
pub mod state;
pub mod status_smoother;
pub mod web_api;
pub mod worker_registry;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use state::AppState;
