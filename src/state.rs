//! Application state
//!
//! Holds all shared components and state

use crate::camera_worker::DEFAULT_FRAME_SYNC_CAPACITY;
use crate::capture_source::SourceOpener;
use crate::classifier::{Classifier, HttpClassifier};
use crate::occupancy_pipeline::OccupancyPipeline;
use crate::realtime_hub::RealtimeHub;
use crate::slot_matcher::DEFAULT_OVERLAP_THRESHOLD;
use crate::slot_store::SlotStore;
use crate::status_smoother::{StatusSmoother, DEFAULT_WINDOW_SIZE};
use crate::worker_registry::WorkerRegistry;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Capture, inference and reconciliation knobs
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Run inference on every Nth frame
    pub detection_interval: u64,
    /// Minimum time between inference starts on one camera
    pub min_process_interval: Duration,
    /// Smoothing window size
    pub smoothing_window: usize,
    /// Minimum overlap ratio for a detection to occupy a slot
    pub overlap_threshold: f64,
    /// Frame-sync ring buffer capacity
    pub frame_sync_capacity: usize,
    /// Consecutive read failures before a worker gives up
    pub max_consecutive_failures: u32,
    /// Pause after a failed read
    pub read_retry_delay: Duration,
    /// Per-inference timeout (None = wait indefinitely)
    pub inference_timeout: Option<Duration>,
    /// Frame rate used when the source reports none
    pub default_fps: f64,
    /// Class labels kept at ingestion (empty = all)
    pub target_classes: Vec<String>,
    /// Reconciliation queue depth per camera
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detection_interval: 5,
            min_process_interval: Duration::from_millis(500),
            smoothing_window: DEFAULT_WINDOW_SIZE,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            frame_sync_capacity: DEFAULT_FRAME_SYNC_CAPACITY,
            max_consecutive_failures: 50,
            read_retry_delay: Duration::from_millis(100),
            inference_timeout: Some(Duration::from_millis(10_000)),
            default_fps: 30.0,
            target_classes: Vec::new(),
            queue_capacity: 16,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let d = Self::default();

        let inference_timeout_ms: u64 = env_or(
            "INFERENCE_TIMEOUT_MS",
            d.inference_timeout.map_or(0, |t| t.as_millis() as u64),
        );

        Self {
            detection_interval: env_or("DETECTION_INTERVAL", d.detection_interval).max(1),
            min_process_interval: Duration::from_millis(env_or(
                "MIN_PROCESS_INTERVAL_MS",
                d.min_process_interval.as_millis() as u64,
            )),
            smoothing_window: env_or("SMOOTHING_FRAMES", d.smoothing_window).max(1),
            overlap_threshold: env_or("DETECTION_THRESHOLD", d.overlap_threshold),
            frame_sync_capacity: env_or("FRAME_BUFFER_SIZE", d.frame_sync_capacity).max(1),
            max_consecutive_failures: env_or("MAX_CONSECUTIVE_FAILURES", d.max_consecutive_failures)
                .max(1),
            read_retry_delay: Duration::from_millis(env_or(
                "READ_RETRY_DELAY_MS",
                d.read_retry_delay.as_millis() as u64,
            )),
            inference_timeout: (inference_timeout_ms > 0)
                .then(|| Duration::from_millis(inference_timeout_ms)),
            default_fps: env_or("DEFAULT_FPS", d.default_fps),
            target_classes: std::env::var("TARGET_CLASSES")
                .map(|v| parse_class_list(&v))
                .unwrap_or(d.target_classes),
            queue_capacity: env_or("RECONCILE_QUEUE_CAPACITY", d.queue_capacity).max(1),
        }
    }
}

/// Split a comma separated class list, dropping blanks
pub fn parse_class_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL (None = in-memory slot store)
    pub database_url: Option<String>,
    /// Detection server URL
    pub detector_url: String,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// Pipeline knobs
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            detector_url: std::env::var("DETECTOR_URL")
                .unwrap_or_else(|_| "http://localhost:9000".to_string()),
            port: env_or("PORT", 8080),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            pipeline: PipelineConfig::from_env(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Slot persistence
    pub store: Arc<dyn SlotStore>,
    /// Per-slot smoothing windows (shared by every camera)
    pub smoother: Arc<StatusSmoother>,
    /// RealtimeHub (WebSocket)
    pub realtime: Arc<RealtimeHub>,
    /// Reconciliation pipeline
    pub pipeline: Arc<OccupancyPipeline>,
    /// Active camera workers
    pub registry: Arc<WorkerRegistry>,
    /// Detection server client, for health reporting
    pub detector: Option<Arc<HttpClassifier>>,
    /// Process start
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component
    pub fn new(
        config: AppConfig,
        store: Arc<dyn SlotStore>,
        opener: Arc<dyn SourceOpener>,
        classifier: Arc<dyn Classifier>,
        detector: Option<Arc<HttpClassifier>>,
        runtime: Handle,
    ) -> Self {
        let pipeline_config = Arc::new(config.pipeline.clone());
        let smoother = Arc::new(StatusSmoother::new(pipeline_config.smoothing_window));
        let realtime = Arc::new(RealtimeHub::new());

        let pipeline = Arc::new(OccupancyPipeline::new(
            Arc::clone(&store),
            Arc::clone(&smoother),
            realtime.clone(),
            pipeline_config.overlap_threshold,
        ));

        let registry = Arc::new(WorkerRegistry::new(
            pipeline_config,
            opener,
            classifier,
            Arc::clone(&pipeline),
            runtime,
        ));

        Self {
            config,
            store,
            smoother,
            realtime,
            pipeline,
            registry,
            detector,
            started_at: Instant::now(),
        }
    }

    /// Stop every camera worker
    pub fn shutdown(&self) {
        let stopped = self.registry.stop_all();
        tracing::info!(stopped = stopped, "Application state shut down");
    }
}
