//! In-memory SlotStore

use super::SlotStore;
use crate::error::{Error, Result};
use crate::models::{CameraId, Slot, SlotEvent, SlotId};
use crate::slot_reconciler::SlotStatusUpdate;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryState {
    slots: BTreeMap<SlotId, Slot>,
    events: Vec<SlotEvent>,
}

/// Slot store kept in process memory
pub struct MemorySlotStore {
    state: RwLock<MemoryState>,
    cameras: RwLock<HashMap<CameraId, String>>,
    fail_commits: AtomicBool,
    commit_count: AtomicU64,
}

impl MemorySlotStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            cameras: RwLock::new(HashMap::new()),
            fail_commits: AtomicBool::new(false),
            commit_count: AtomicU64::new(0),
        }
    }

    /// Insert or replace a slot
    pub async fn insert_slot(&self, slot: Slot) {
        self.state.write().await.slots.insert(slot.id, slot);
    }

    /// Register a camera stream descriptor
    pub async fn insert_camera(&self, camera_id: CameraId, stream_url: impl Into<String>) {
        self.cameras.write().await.insert(camera_id, stream_url.into());
    }

    pub async fn slot(&self, slot_id: SlotId) -> Option<Slot> {
        self.state.read().await.slots.get(&slot_id).cloned()
    }

    /// All events appended so far
    pub async fn events(&self) -> Vec<SlotEvent> {
        self.state.read().await.events.clone()
    }

    /// Make every subsequent commit fail (storage outage)
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successful commits
    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }
}

impl Default for MemorySlotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotStore for MemorySlotStore {
    fn get_slots(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Vec<Slot>>> {
        async move {
            let state = self.state.read().await;
            Ok(state
                .slots
                .values()
                .filter(|s| s.camera_id == camera_id)
                .cloned()
                .collect())
        }
        .boxed()
    }

    fn get_slots_by_ids<'a>(&'a self, ids: &'a [SlotId]) -> BoxFuture<'a, Result<Vec<Slot>>> {
        async move {
            let state = self.state.read().await;
            Ok(ids
                .iter()
                .filter_map(|id| state.slots.get(id).cloned())
                .collect())
        }
        .boxed()
    }

    fn commit<'a>(
        &'a self,
        updates: &'a [SlotStatusUpdate],
        events: &'a [SlotEvent],
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(Error::Database("memory store rejecting commits".to_string()));
            }

            // Single write guard covers the whole cycle
            let mut state = self.state.write().await;
            for update in updates {
                if let Some(slot) = state.slots.get_mut(&update.slot_id) {
                    slot.status = update.status;
                    slot.last_changed_at = update.changed_at;
                }
            }
            state.events.extend_from_slice(events);
            self.commit_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn camera_source(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Option<String>>> {
        async move { Ok(self.cameras.read().await.get(&camera_id).cloned()) }.boxed()
    }
}
