//! Slot Reconciler
//!
//! Diffs smoothed occupancy against the persisted slot snapshot.
//! Only transitions produce writes and events; unchanged slots produce nothing.

use crate::models::{Occupancy, Slot, SlotEvent, SlotId, SlotStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Status write for one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatusUpdate {
    pub slot_id: SlotId,
    pub status: SlotStatus,
    pub changed_at: DateTime<Utc>,
}

/// Writes and events produced by one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub updates: Vec<SlotStatusUpdate>,
    pub events: Vec<SlotEvent>,
}

impl ReconcileOutcome {
    /// Number of slots whose status changed
    pub fn change_count(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Compare smoothed statuses with the persisted snapshot
///
/// Slots absent from `persisted` (deleted mid-cycle) are skipped.
pub fn reconcile(
    smoothed: &BTreeMap<SlotId, Occupancy>,
    persisted: &[Slot],
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    let by_id: HashMap<SlotId, &Slot> = persisted.iter().map(|s| (s.id, s)).collect();
    let mut outcome = ReconcileOutcome::default();

    for (slot_id, occupancy) in smoothed {
        let Some(slot) = by_id.get(slot_id) else {
            tracing::debug!(slot_id = *slot_id, "Slot vanished before reconciliation, skipping");
            continue;
        };

        let new_status = SlotStatus::from(*occupancy);
        if slot.status == new_status {
            continue;
        }

        outcome.updates.push(SlotStatusUpdate {
            slot_id: *slot_id,
            status: new_status,
            changed_at: now,
        });
        outcome.events.push(SlotEvent {
            slot_id: *slot_id,
            old_status: slot.status,
            new_status,
            start_time: now,
        });
    }

    outcome
}
