//! OccupancyPipeline - Detection Batch Reconciliation
//!
//! ## Responsibilities
//!
//! - Per-camera reconciliation queue (one consumer task per camera)
//! - Match -> smooth -> reconcile -> commit -> publish for every batch
//! - Serialize cycles of the same camera, run different cameras in parallel
//! - Worker lifecycle notifications
//!
//! Storage and publisher failures are logged. Smoothing state has already
//! advanced by then and is not rolled back.

use crate::camera_worker::InferenceBatch;
use crate::error::Result;
use crate::models::{CameraId, Detection, OccupancySummary, SlotId, SlotStatus};
use crate::realtime_hub::{EventPublisher, SlotSnapshot, SlotUpdate, WorkerStatusMessage};
use crate::slot_matcher;
use crate::slot_reconciler;
use crate::slot_store::SlotStore;
use crate::status_smoother::StatusSmoother;
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Result of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub camera_id: CameraId,
    pub frame_id: Option<u64>,
    pub detections: usize,
    pub slots_evaluated: usize,
    pub changed: usize,
    pub published: bool,
}

/// OccupancyPipeline instance
pub struct OccupancyPipeline {
    store: Arc<dyn SlotStore>,
    smoother: Arc<StatusSmoother>,
    publisher: Arc<dyn EventPublisher>,
    threshold: f64,
    /// Per-camera cycle locks
    camera_locks: RwLock<HashMap<CameraId, Arc<Mutex<()>>>>,
}

impl OccupancyPipeline {
    /// Create new OccupancyPipeline
    pub fn new(
        store: Arc<dyn SlotStore>,
        smoother: Arc<StatusSmoother>,
        publisher: Arc<dyn EventPublisher>,
        threshold: f64,
    ) -> Self {
        Self {
            store,
            smoother,
            publisher,
            threshold,
            camera_locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    /// Reconcile one inference batch
    pub async fn process(&self, batch: &InferenceBatch) -> Result<CycleReport> {
        self.process_detections(batch.camera_id, &batch.detections, Some(batch.frame_id))
            .await
    }

    /// Reconcile a camera's slots against a set of detections
    pub async fn process_detections(
        &self,
        camera_id: CameraId,
        detections: &[Detection],
        frame_id: Option<u64>,
    ) -> Result<CycleReport> {
        let mut report = CycleReport {
            camera_id,
            frame_id,
            detections: detections.len(),
            ..Default::default()
        };

        // Matching only reads polygons; statuses are re-read under the lock
        let slots = self.store.get_slots(camera_id).await?;
        if slots.is_empty() {
            tracing::debug!(camera_id = camera_id, "No slots configured, skipping cycle");
            return Ok(report);
        }

        let lock = self.get_or_create_lock(camera_id).await;
        let _guard = lock.lock().await;

        let raw = slot_matcher::match_detections(&slots, detections, self.threshold);

        let mut smoothed = BTreeMap::new();
        for (slot_id, occupancy) in &raw {
            let stable = self.smoother.observe(*slot_id, *occupancy).await;
            smoothed.insert(*slot_id, stable);
        }

        // Re-read: another camera may have written these slots since the first fetch
        let ids: Vec<SlotId> = smoothed.keys().copied().collect();
        let persisted = self.store.get_slots_by_ids(&ids).await?;

        if persisted.len() < ids.len() {
            for slot_id in ids.iter().filter(|id| !persisted.iter().any(|s| s.id == **id)) {
                tracing::info!(
                    camera_id = camera_id,
                    slot_id = *slot_id,
                    "Slot deleted during cycle"
                );
                self.smoother.forget(*slot_id).await;
            }
        }

        let outcome = slot_reconciler::reconcile(&smoothed, &persisted, Utc::now());
        report.slots_evaluated = persisted.len();
        report.changed = outcome.change_count();

        if !outcome.is_empty() {
            self.store.commit(&outcome.updates, &outcome.events).await?;
            tracing::info!(
                camera_id = camera_id,
                frame_id = ?frame_id,
                changed = outcome.change_count(),
                "Slot statuses updated"
            );
        }

        let applied: HashMap<SlotId, SlotStatus> = outcome
            .updates
            .iter()
            .map(|u| (u.slot_id, u.status))
            .collect();
        let snapshot = persisted
            .iter()
            .map(|slot| {
                let mut snap = SlotSnapshot::from(slot);
                if let Some(status) = applied.get(&slot.id) {
                    snap.status = *status;
                }
                snap
            })
            .collect();

        let update = SlotUpdate {
            camera_id,
            slots: snapshot,
            detections: detections.to_vec(),
            frame_id,
            timestamp: Utc::now(),
        };
        match self.publisher.publish(update).await {
            Ok(()) => report.published = true,
            Err(e) => {
                tracing::warn!(camera_id = camera_id, error = %e, "Failed to publish slot update");
            }
        }

        Ok(report)
    }

    /// Spawn the reconciliation task for one camera
    ///
    /// The task exits once every sender is dropped.
    pub fn spawn_camera_queue(
        self: &Arc<Self>,
        camera_id: CameraId,
        capacity: usize,
        runtime: &Handle,
    ) -> (mpsc::Sender<InferenceBatch>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<InferenceBatch>(capacity.max(1));
        let pipeline = Arc::clone(self);

        let handle = runtime.spawn(async move {
            while let Some(batch) = rx.recv().await {
                match pipeline.process(&batch).await {
                    Ok(report) => {
                        tracing::debug!(
                            camera_id = camera_id,
                            frame_id = batch.frame_id,
                            changed = report.changed,
                            "Reconciliation cycle done"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            camera_id = camera_id,
                            frame_id = batch.frame_id,
                            error_code = e.code(),
                            error = %e,
                            "Reconciliation cycle failed"
                        );
                    }
                }
            }
            tracing::debug!(camera_id = camera_id, "Reconciliation queue closed");
        });

        (tx, handle)
    }

    /// Announce that a worker stopped on its own
    pub async fn notify_worker_stopped(&self, camera_id: CameraId, reason: String) {
        let status = WorkerStatusMessage {
            camera_id,
            running: false,
            reason,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.publisher.notify_worker(status).await {
            tracing::warn!(camera_id = camera_id, error = %e, "Failed to publish worker status");
        }
    }

    /// Slot counts by status for a camera
    pub async fn summary(&self, camera_id: CameraId) -> Result<OccupancySummary> {
        let slots = self.store.get_slots(camera_id).await?;
        Ok(OccupancySummary::from_slots(camera_id, &slots))
    }

    async fn get_or_create_lock(&self, camera_id: CameraId) -> Arc<Mutex<()>> {
        {
            let locks = self.camera_locks.read().await;
            if let Some(lock) = locks.get(&camera_id) {
                return lock.clone();
            }
        }

        let mut locks = self.camera_locks.write().await;
        locks
            .entry(camera_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
