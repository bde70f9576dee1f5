//! SlotStore - Slot Persistence
//!
//! ## Responsibilities
//!
//! - Fetch a camera's slots fresh for every reconciliation cycle
//! - Re-read slots by id after smoothing
//! - Apply one cycle's status writes and event appends atomically
//! - Resolve a camera's stream descriptor
//!
//! Two backends: MySQL (sqlx) for deployments, in-memory for tests and DB-less runs.

mod memory;
mod repository;

pub use memory::MemorySlotStore;
pub use repository::MySqlSlotStore;

use crate::error::Result;
use crate::models::{CameraId, Slot, SlotEvent, SlotId};
use crate::slot_reconciler::SlotStatusUpdate;
use futures::future::BoxFuture;

/// Storage seam used by the reconciliation pipeline
pub trait SlotStore: Send + Sync {
    /// All slots of a camera
    fn get_slots(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Vec<Slot>>>;

    /// Slots with the given ids; unknown ids are omitted
    fn get_slots_by_ids<'a>(&'a self, ids: &'a [SlotId]) -> BoxFuture<'a, Result<Vec<Slot>>>;

    /// Write every status update and append every event in one transaction
    fn commit<'a>(
        &'a self,
        updates: &'a [SlotStatusUpdate],
        events: &'a [SlotEvent],
    ) -> BoxFuture<'a, Result<()>>;

    /// Stream descriptor configured for a camera
    fn camera_source(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Option<String>>>;
}
