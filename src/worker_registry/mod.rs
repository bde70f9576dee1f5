//! WorkerRegistry - Active Camera Workers
//!
//! ## Responsibilities
//!
//! - Exactly one worker per running camera id (duplicate start returns the existing worker)
//! - Capture thread + reconciliation queue per worker
//! - Stop one / stop all
//! - Self-deregistration when a worker stops on its own
//!
//! The registry is passed around explicitly through `AppState`; there is no
//! process-global table.

use crate::camera_worker::{CameraWorker, WorkerStats};
use crate::capture_source::{SourceDescriptor, SourceOpener};
use crate::classifier::Classifier;
use crate::error::{Error, Result};
use crate::models::CameraId;
use crate::occupancy_pipeline::OccupancyPipeline;
use crate::state::PipelineConfig;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;

/// WorkerRegistry instance
pub struct WorkerRegistry {
    config: Arc<PipelineConfig>,
    opener: Arc<dyn SourceOpener>,
    classifier: Arc<dyn Classifier>,
    pipeline: Arc<OccupancyPipeline>,
    runtime: Handle,
    workers: RwLock<HashMap<CameraId, Arc<CameraWorker>>>,
}

impl WorkerRegistry {
    /// Create new WorkerRegistry
    pub fn new(
        config: Arc<PipelineConfig>,
        opener: Arc<dyn SourceOpener>,
        classifier: Arc<dyn Classifier>,
        pipeline: Arc<OccupancyPipeline>,
        runtime: Handle,
    ) -> Self {
        Self {
            config,
            opener,
            classifier,
            pipeline,
            runtime,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Start a worker for a camera, or return the one already running
    pub fn start(
        self: &Arc<Self>,
        camera_id: CameraId,
        descriptor: SourceDescriptor,
    ) -> Result<Arc<CameraWorker>> {
        let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = workers.get(&camera_id) {
            tracing::info!(camera_id = camera_id, "Camera worker already running");
            return Ok(Arc::clone(existing));
        }

        let worker = Arc::new(CameraWorker::new(
            camera_id,
            descriptor,
            Arc::clone(&self.config),
        ));
        let (batches, _queue) =
            self.pipeline
                .spawn_camera_queue(camera_id, self.config.queue_capacity, &self.runtime);

        let registry: Weak<Self> = Arc::downgrade(self);
        let runner = Arc::clone(&worker);
        let opener = Arc::clone(&self.opener);
        let classifier = Arc::clone(&self.classifier);
        let runtime = self.runtime.clone();

        std::thread::Builder::new()
            .name(format!("capture-{}", camera_id))
            .spawn(move || {
                let exit = Arc::clone(&runner).run(opener.as_ref(), classifier, runtime, batches);
                if exit.is_self_terminated() {
                    if let Some(registry) = registry.upgrade() {
                        registry.deregister(&runner, exit.reason());
                    }
                }
            })
            .map_err(|e| Error::Internal(format!("failed to spawn capture thread: {}", e)))?;

        workers.insert(camera_id, Arc::clone(&worker));
        tracing::info!(
            camera_id = camera_id,
            source = %worker.descriptor(),
            "Camera worker started"
        );
        Ok(worker)
    }

    /// Stop a camera's worker; false if none was running
    pub fn stop(&self, camera_id: CameraId) -> bool {
        let removed = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&camera_id);

        match removed {
            Some(worker) => {
                worker.stop();
                true
            }
            None => {
                tracing::warn!(camera_id = camera_id, "No worker running for camera");
                false
            }
        }
    }

    /// Stop every worker, returning how many were stopped
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Arc<CameraWorker>> = self
            .workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, w)| w)
            .collect();

        for worker in &drained {
            worker.stop();
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "All camera workers stopped");
        }
        drained.len()
    }

    pub fn get(&self, camera_id: CameraId) -> Option<Arc<CameraWorker>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&camera_id)
            .cloned()
    }

    /// Stats of every registered worker keyed by camera id
    pub fn list(&self) -> BTreeMap<CameraId, WorkerStats> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, worker)| (*id, worker.stats()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a worker that stopped on its own, unless it was already replaced
    fn deregister(&self, worker: &Arc<CameraWorker>, reason: String) {
        let camera_id = worker.camera_id();
        let removed = {
            let mut workers = self.workers.write().unwrap_or_else(PoisonError::into_inner);
            match workers.get(&camera_id) {
                Some(current) if Arc::ptr_eq(current, worker) => {
                    workers.remove(&camera_id).is_some()
                }
                _ => false,
            }
        };

        if removed {
            tracing::warn!(camera_id = camera_id, reason = %reason, "Camera worker deregistered");
            let pipeline = Arc::clone(&self.pipeline);
            self.runtime.spawn(async move {
                pipeline.notify_worker_stopped(camera_id, reason).await;
            });
        }
    }
}
