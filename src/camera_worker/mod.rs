//! CameraWorker - Per-Camera Capture/Inference Cycle
//!
//! ## Responsibilities
//!
//! - Blocking frame acquisition on a dedicated thread
//! - Throttled inference scheduling (every Nth frame, one in flight, minimum spacing)
//! - Consecutive read-failure tracking and exhaustion
//! - Latest-frame exposure for snapshot/stream readers
//!
//! ## Lifecycle
//!
//! `Idle -> Capturing -> (Inferring while a request is in flight) -> Capturing -> ... -> Stopped`
//!
//! Inference runs as a tokio task so a slow classifier never stalls capture.
//! Completed, non-empty batches go to the camera's reconciliation queue.

mod frame_sync;

pub use frame_sync::{FrameRecord, FrameSyncBuffer, DEFAULT_FRAME_SYNC_CAPACITY};

use crate::capture_source::{Frame, SourceDescriptor, SourceOpener};
use crate::classifier::{self, Classifier};
use crate::error::Error;
use crate::models::{CameraId, Detection};
use crate::state::PipelineConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Capturing,
    Inferring,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Capturing => "capturing",
            WorkerState::Inferring => "inferring",
            WorkerState::Stopped => "stopped",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            WorkerState::Idle => 0,
            WorkerState::Capturing => 1,
            WorkerState::Inferring => 2,
            WorkerState::Stopped => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Idle,
            1 => WorkerState::Capturing,
            2 => WorkerState::Inferring,
            _ => WorkerState::Stopped,
        }
    }
}

/// Why the capture loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// `stop()` was requested
    Stopped,
    /// The capture source could not be opened
    OpenFailed(String),
    /// Consecutive read failures reached the ceiling
    Exhausted { failures: u32 },
}

impl WorkerExit {
    /// Loop ended on its own (not through `stop()`)
    pub fn is_self_terminated(&self) -> bool {
        !matches!(self, WorkerExit::Stopped)
    }

    pub fn reason(&self) -> String {
        match self {
            WorkerExit::Stopped => "stopped".to_string(),
            WorkerExit::OpenFailed(e) => format!("open failed: {}", e),
            WorkerExit::Exhausted { failures } => {
                format!("{} consecutive read failures", failures)
            }
        }
    }
}

/// Validated detections from one inference
#[derive(Debug, Clone)]
pub struct InferenceBatch {
    pub camera_id: CameraId,
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Latest captured frame
#[derive(Debug, Clone)]
pub struct ExposedFrame {
    pub frame: Frame,
    pub frame_id: u64,
    pub captured_at: DateTime<Utc>,
}

/// Worker statistics
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub camera_id: CameraId,
    pub state: WorkerState,
    pub running: bool,
    pub healthy: bool,
    pub frame_id: u64,
    pub processed_frames: usize,
    pub total_frames: usize,
    pub detection_rate: String,
    pub consecutive_failures: u32,
    pub inference_in_flight: bool,
    pub inferences: u64,
    pub source: String,
    pub started_at: DateTime<Utc>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// CameraWorker instance
pub struct CameraWorker {
    camera_id: CameraId,
    descriptor: SourceDescriptor,
    config: Arc<PipelineConfig>,
    running: AtomicBool,
    state: AtomicU8,
    frame_counter: AtomicU64,
    consecutive_failures: AtomicU32,
    in_flight: AtomicBool,
    inferences: AtomicU64,
    last_inference_at: Mutex<Option<Instant>>,
    current_frame: RwLock<Option<ExposedFrame>>,
    frame_sync: Mutex<FrameSyncBuffer>,
    started_at: DateTime<Utc>,
}

/// Clears the in-flight flag on every completion path
struct InFlightGuard(Arc<CameraWorker>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::Release);
    }
}

impl CameraWorker {
    /// Create new CameraWorker (Idle, running)
    pub fn new(
        camera_id: CameraId,
        descriptor: SourceDescriptor,
        config: Arc<PipelineConfig>,
    ) -> Self {
        let capacity = config.frame_sync_capacity;
        Self {
            camera_id,
            descriptor,
            config,
            running: AtomicBool::new(true),
            state: AtomicU8::new(WorkerState::Idle.to_u8()),
            frame_counter: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            inferences: AtomicU64::new(0),
            last_inference_at: Mutex::new(None),
            current_frame: RwLock::new(None),
            frame_sync: Mutex::new(FrameSyncBuffer::new(capacity)),
            started_at: Utc::now(),
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request stop; the loop exits at the top of its next iteration
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!(camera_id = self.camera_id, "Camera worker stop requested");
        }
    }

    pub fn state(&self) -> WorkerState {
        let state = WorkerState::from_u8(self.state.load(Ordering::Acquire));
        if state == WorkerState::Capturing && self.in_flight.load(Ordering::Acquire) {
            WorkerState::Inferring
        } else {
            state
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter.load(Ordering::Acquire)
    }

    pub fn inference_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Copy of the latest frame
    pub fn current_frame(&self) -> Option<ExposedFrame> {
        self.current_frame
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get statistics
    pub fn stats(&self) -> WorkerStats {
        let (processed, total) = {
            let sync = lock(&self.frame_sync);
            (sync.processed(), sync.len())
        };
        let running = self.is_running();
        let frame_id = self.frame_count();

        WorkerStats {
            camera_id: self.camera_id,
            state: self.state(),
            running,
            healthy: running && frame_id > 0,
            frame_id,
            processed_frames: processed,
            total_frames: total,
            detection_rate: format!("{}/{}", processed, total),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            inference_in_flight: self.inference_in_flight(),
            inferences: self.inferences.load(Ordering::Acquire),
            source: self.descriptor.to_string(),
            started_at: self.started_at,
        }
    }

    /// Decide whether this frame goes to inference, claiming the in-flight slot if so
    pub fn try_claim_inference(&self, frame_id: u64, now: Instant) -> bool {
        if frame_id % self.config.detection_interval.max(1) != 0 {
            return false;
        }
        if self.in_flight.load(Ordering::Acquire) {
            return false;
        }

        let mut last = lock(&self.last_inference_at);
        if let Some(prev) = *last {
            if now.saturating_duration_since(prev) < self.config.min_process_interval {
                return false;
            }
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *last = Some(now);
        true
    }

    /// Blocking capture loop; returns when stopped, on open failure or on exhaustion
    ///
    /// The source is released before returning.
    pub fn run(
        self: Arc<Self>,
        opener: &dyn SourceOpener,
        classifier: Arc<dyn Classifier>,
        runtime: Handle,
        batches: mpsc::Sender<InferenceBatch>,
    ) -> WorkerExit {
        let mut source = match opener.open(&self.descriptor) {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(
                    camera_id = self.camera_id,
                    source = %self.descriptor,
                    error = %e,
                    "Failed to open capture source"
                );
                self.running.store(false, Ordering::Release);
                self.set_state(WorkerState::Stopped);
                return WorkerExit::OpenFailed(e.to_string());
            }
        };

        // Opening may block (network probe); honour a stop requested meanwhile
        if !self.is_running() {
            source.release();
            self.set_state(WorkerState::Stopped);
            tracing::info!(camera_id = self.camera_id, "Camera worker stopped while opening");
            return WorkerExit::Stopped;
        }

        let fps = source
            .fps()
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(self.config.default_fps);
        let frame_interval = Duration::from_secs_f64(1.0 / fps.max(1.0));

        self.set_state(WorkerState::Capturing);
        tracing::info!(
            camera_id = self.camera_id,
            source = %self.descriptor,
            fps = fps,
            "Camera worker capturing"
        );

        let exit = loop {
            if !self.is_running() {
                break WorkerExit::Stopped;
            }

            let frame = match source.read() {
                Ok(frame) => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    frame
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= self.config.max_consecutive_failures {
                        tracing::error!(
                            camera_id = self.camera_id,
                            failures = failures,
                            error = %e,
                            "Capture source exhausted"
                        );
                        break WorkerExit::Exhausted { failures };
                    }
                    tracing::warn!(
                        camera_id = self.camera_id,
                        failures = failures,
                        error = %e,
                        "Failed to read frame"
                    );
                    std::thread::sleep(self.config.read_retry_delay);
                    continue;
                }
            };

            let frame_id = self.frame_counter.fetch_add(1, Ordering::AcqRel) + 1;
            let captured_at = Utc::now();

            *self
                .current_frame
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(ExposedFrame {
                frame: frame.clone(),
                frame_id,
                captured_at,
            });
            lock(&self.frame_sync).push(frame_id, captured_at);

            if self.try_claim_inference(frame_id, Instant::now()) {
                self.dispatch_inference(
                    frame,
                    frame_id,
                    captured_at,
                    &classifier,
                    &runtime,
                    &batches,
                );
            }

            std::thread::sleep(frame_interval);
        };

        source.release();
        self.running.store(false, Ordering::Release);
        self.set_state(WorkerState::Stopped);
        tracing::info!(
            camera_id = self.camera_id,
            frames = self.frame_count(),
            reason = %exit.reason(),
            "Camera worker stopped"
        );
        exit
    }

    fn dispatch_inference(
        self: &Arc<Self>,
        frame: Frame,
        frame_id: u64,
        captured_at: DateTime<Utc>,
        classifier: &Arc<dyn Classifier>,
        runtime: &Handle,
        batches: &mpsc::Sender<InferenceBatch>,
    ) {
        let guard = InFlightGuard(Arc::clone(self));
        let classifier = Arc::clone(classifier);
        let batches = batches.clone();

        runtime.spawn(async move {
            let worker = &guard.0;
            let started = Instant::now();

            let result = match worker.config.inference_timeout {
                Some(limit) => tokio::time::timeout(limit, classifier.infer(frame))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Inference(format!(
                            "timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => classifier.infer(frame).await,
            };

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(
                        camera_id = worker.camera_id,
                        frame_id = frame_id,
                        error = %e,
                        "Inference failed"
                    );
                    Vec::new()
                }
            };

            let detections = classifier::to_detections(
                raw,
                frame_id,
                captured_at,
                &worker.config.target_classes,
            );
            lock(&worker.frame_sync).mark_processed(frame_id);
            worker.inferences.fetch_add(1, Ordering::AcqRel);

            tracing::debug!(
                camera_id = worker.camera_id,
                frame_id = frame_id,
                detections = detections.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Inference completed"
            );

            if detections.is_empty() {
                return;
            }

            let batch = InferenceBatch {
                camera_id: worker.camera_id,
                frame_id,
                timestamp: captured_at,
                detections,
            };
            if batches.send(batch).await.is_err() {
                tracing::debug!(
                    camera_id = worker.camera_id,
                    frame_id = frame_id,
                    "Reconciliation queue closed, dropping batch"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{car_at, ScriptedClassifier, ScriptedOpener};

    fn config(f: impl FnOnce(&mut PipelineConfig)) -> Arc<PipelineConfig> {
        let mut config = PipelineConfig {
            read_retry_delay: Duration::from_millis(1),
            min_process_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        f(&mut config);
        Arc::new(config)
    }

    fn worker(config: Arc<PipelineConfig>) -> Arc<CameraWorker> {
        Arc::new(CameraWorker::new(7, SourceDescriptor::Device(0), config))
    }

    #[test]
    fn test_claim_respects_interval_and_in_flight() {
        let w = worker(config(|c| c.detection_interval = 5));
        let now = Instant::now();

        assert!(!w.try_claim_inference(3, now));
        assert!(w.try_claim_inference(5, now));
        // Already in flight
        assert!(!w.try_claim_inference(10, now));

        w.in_flight.store(false, Ordering::Release);
        assert!(w.try_claim_inference(10, now));
    }

    #[test]
    fn test_claim_respects_min_spacing() {
        let w = worker(config(|c| {
            c.detection_interval = 1;
            c.min_process_interval = Duration::from_millis(500);
        }));
        let t0 = Instant::now();

        assert!(w.try_claim_inference(1, t0));
        w.in_flight.store(false, Ordering::Release);
        assert!(!w.try_claim_inference(2, t0 + Duration::from_millis(100)));
        assert!(w.try_claim_inference(3, t0 + Duration::from_millis(600)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exhaustion_after_failure_ceiling() {
        let w = worker(config(|c| c.max_consecutive_failures = 50));
        let opener = Arc::new(ScriptedOpener::failing_reads());
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::returning(vec![]));
        let (tx, _rx) = mpsc::channel(4);

        let runner = Arc::clone(&w);
        let runner_opener = Arc::clone(&opener);
        let handle = Handle::current();
        let exit = tokio::task::spawn_blocking(move || {
            runner.run(runner_opener.as_ref(), classifier, handle, tx)
        })
        .await
        .unwrap();

        assert_eq!(exit, WorkerExit::Exhausted { failures: 50 });
        assert_eq!(w.state(), WorkerState::Stopped);
        assert!(!w.is_running());
        assert_eq!(opener.reads(), 50);
        assert_eq!(opener.releases(), 1);
        assert!(!w.stats().healthy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_open_failure_stops_worker() {
        let w = worker(config(|_| {}));
        let opener = ScriptedOpener::failing_open();
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::returning(vec![]));
        let (tx, _rx) = mpsc::channel(4);

        let runner = Arc::clone(&w);
        let handle = Handle::current();
        let exit = tokio::task::spawn_blocking(move || runner.run(&opener, classifier, handle, tx))
            .await
            .unwrap();

        assert!(matches!(exit, WorkerExit::OpenFailed(_)));
        assert!(exit.is_self_terminated());
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_slow_open_skips_capture() {
        let w = worker(config(|_| {}));
        let opener =
            Arc::new(ScriptedOpener::endless().with_open_delay(Duration::from_millis(300)));
        let classifier: Arc<dyn Classifier> = Arc::new(ScriptedClassifier::returning(vec![]));
        let (tx, _rx) = mpsc::channel(4);

        let runner = Arc::clone(&w);
        let runner_opener = Arc::clone(&opener);
        let handle = Handle::current();
        let join = tokio::task::spawn_blocking(move || {
            runner.run(runner_opener.as_ref(), classifier, handle, tx)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(w.state(), WorkerState::Idle);
        w.stop();

        let exit = join.await.unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(opener.reads(), 0);
        assert_eq!(opener.releases(), 1);
        assert!(w.current_frame().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_inference_batches_are_forwarded() {
        let w = worker(config(|c| c.detection_interval = 2));
        let opener = Arc::new(ScriptedOpener::endless());
        let classifier =
            Arc::new(ScriptedClassifier::returning(vec![car_at(10.0, 10.0, 80.0, 80.0)]));
        let (tx, mut rx) = mpsc::channel(4);

        let runner = Arc::clone(&w);
        let runner_opener = Arc::clone(&opener);
        let runner_classifier: Arc<dyn Classifier> = classifier.clone();
        let handle = Handle::current();
        let join = tokio::task::spawn_blocking(move || {
            runner.run(runner_opener.as_ref(), runner_classifier, handle, tx)
        });

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.camera_id, 7);
        assert_eq!(batch.frame_id % 2, 0);
        assert_eq!(batch.detections.len(), 1);

        let frame = w.current_frame().unwrap();
        assert!(frame.frame_id >= batch.frame_id);
        assert!(w.stats().healthy);

        w.stop();
        let exit = join.await.unwrap();
        assert_eq!(exit, WorkerExit::Stopped);
        assert_eq!(opener.releases(), 1);
        assert!(classifier.calls() >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_inference_clears_in_flight() {
        let w = worker(config(|c| c.detection_interval = 1));
        let opener = Arc::new(ScriptedOpener::endless());
        let classifier = Arc::new(ScriptedClassifier::failing());
        let (tx, mut rx) = mpsc::channel(4);

        let runner = Arc::clone(&w);
        let runner_opener = Arc::clone(&opener);
        let runner_classifier: Arc<dyn Classifier> = classifier.clone();
        let handle = Handle::current();
        let join = tokio::task::spawn_blocking(move || {
            runner.run(runner_opener.as_ref(), runner_classifier, handle, tx)
        });

        // Repeated calls prove the flag is released after each failure
        let deadline = Instant::now() + Duration::from_secs(5);
        while classifier.calls() < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        w.stop();
        join.await.unwrap();

        assert!(classifier.calls() >= 3);
        assert!(rx.try_recv().is_err());
    }
}
