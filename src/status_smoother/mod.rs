//! StatusSmoother - Per-Slot Majority Vote
//!
//! ## Responsibilities
//!
//! - Keep a bounded window of raw classifications per slot
//! - Convert noisy per-cycle classifications into a stable status
//! - Pin the first observation until the window has filled once
//!
//! Shared by every camera. Each slot has its own lock, so observing different slots
//! never contends on the same window.

use crate::models::{Occupancy, SlotId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Default window size
pub const DEFAULT_WINDOW_SIZE: usize = 3;

/// Sliding window for one slot
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    values: VecDeque<Occupancy>,
    capacity: usize,
    first: Occupancy,
    observed: u64,
}

impl SmoothingWindow {
    fn new(capacity: usize, first: Occupancy) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            first,
            observed: 0,
        }
    }

    /// Record one classification and return the stable status
    fn push(&mut self, raw: Occupancy) -> Occupancy {
        self.values.push_back(raw);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
        self.observed += 1;

        if self.observed < self.capacity as u64 {
            return self.first;
        }
        self.mode()
    }

    /// Most frequent value, earliest in the window on ties
    fn mode(&self) -> Occupancy {
        let mut best = self.first;
        let mut best_count = 0;
        for (i, candidate) in self.values.iter().enumerate() {
            if self.values.iter().take(i).any(|v| v == candidate) {
                continue;
            }
            let count = self.values.iter().filter(|v| *v == candidate).count();
            if count > best_count {
                best = *candidate;
                best_count = count;
            }
        }
        best
    }

    pub fn values(&self) -> Vec<Occupancy> {
        self.values.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// StatusSmoother instance
pub struct StatusSmoother {
    window_size: usize,
    windows: RwLock<HashMap<SlotId, Arc<Mutex<SmoothingWindow>>>>,
}

impl StatusSmoother {
    /// Create new StatusSmoother (window size is clamped to at least 1)
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            windows: RwLock::new(HashMap::new()),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Record a raw classification for a slot and return its stable status
    pub async fn observe(&self, slot_id: SlotId, raw: Occupancy) -> Occupancy {
        let window = self.get_or_create_window(slot_id, raw).await;
        let mut window = window.lock().await;
        window.push(raw)
    }

    /// Drop a slot's history (slot deleted)
    pub async fn forget(&self, slot_id: SlotId) -> bool {
        let removed = self.windows.write().await.remove(&slot_id).is_some();
        if removed {
            tracing::debug!(slot_id = slot_id, "Smoothing window dropped");
        }
        removed
    }

    /// Copy of a slot's window, if any
    pub async fn snapshot(&self, slot_id: SlotId) -> Option<SmoothingWindow> {
        let window = {
            let windows = self.windows.read().await;
            windows.get(&slot_id).cloned()
        }?;
        let window = window.lock().await;
        Some(window.clone())
    }

    /// Number of slots with history
    pub async fn tracked_slots(&self) -> usize {
        self.windows.read().await.len()
    }

    async fn get_or_create_window(
        &self,
        slot_id: SlotId,
        first: Occupancy,
    ) -> Arc<Mutex<SmoothingWindow>> {
        {
            let windows = self.windows.read().await;
            if let Some(window) = windows.get(&slot_id) {
                return window.clone();
            }
        }

        let mut windows = self.windows.write().await;
        windows
            .entry(slot_id)
            .or_insert_with(|| Arc::new(Mutex::new(SmoothingWindow::new(self.window_size, first))))
            .clone()
    }
}

impl Default for StatusSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Occupancy::{Empty, Occupied};

    async fn feed(smoother: &StatusSmoother, slot_id: SlotId, seq: &[Occupancy]) -> Vec<Occupancy> {
        let mut out = Vec::new();
        for raw in seq {
            out.push(smoother.observe(slot_id, *raw).await);
        }
        out
    }

    #[tokio::test]
    async fn test_warm_up_pins_first_observation() {
        let smoother = StatusSmoother::new(3);
        let out = feed(&smoother, 1, &[Occupied, Empty, Empty]).await;
        assert_eq!(out, vec![Occupied, Occupied, Empty]);
    }

    #[tokio::test]
    async fn test_majority_after_warm_up() {
        let smoother = StatusSmoother::new(3);
        let out = feed(&smoother, 1, &[Empty, Occupied, Occupied, Empty, Empty]).await;
        assert_eq!(out, vec![Empty, Empty, Occupied, Occupied, Empty]);
    }

    #[tokio::test]
    async fn test_single_late_occupied_is_suppressed() {
        let smoother = StatusSmoother::new(3);
        let out = feed(&smoother, 1, &[Empty, Empty, Occupied]).await;
        assert_eq!(out, vec![Empty, Empty, Empty]);
    }

    #[tokio::test]
    async fn test_steady_occupied_stays_occupied() {
        let smoother = StatusSmoother::new(3);
        let out = feed(&smoother, 1, &[Occupied, Occupied, Occupied]).await;
        assert_eq!(out, vec![Occupied, Occupied, Occupied]);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let smoother = StatusSmoother::new(3);
        feed(&smoother, 1, &[Empty, Occupied, Occupied, Occupied, Occupied]).await;
        let window = smoother.snapshot(1).await.unwrap();
        assert_eq!(window.len(), 3);
        assert_eq!(window.values(), vec![Occupied, Occupied, Occupied]);
    }

    #[tokio::test]
    async fn test_tie_goes_to_earliest_in_window() {
        let smoother = StatusSmoother::new(4);
        let out = feed(&smoother, 1, &[Occupied, Empty, Empty, Occupied]).await;
        assert_eq!(out[3], Occupied);

        let out = feed(&smoother, 2, &[Empty, Occupied, Occupied, Empty]).await;
        assert_eq!(out[3], Empty);
    }

    #[tokio::test]
    async fn test_window_size_one_passes_through() {
        let smoother = StatusSmoother::new(0);
        assert_eq!(smoother.window_size(), 1);
        let out = feed(&smoother, 1, &[Occupied, Empty, Occupied]).await;
        assert_eq!(out, vec![Occupied, Empty, Occupied]);
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let smoother = StatusSmoother::new(3);
        smoother.observe(1, Occupied).await;
        assert_eq!(smoother.observe(2, Empty).await, Empty);
        assert_eq!(smoother.tracked_slots().await, 2);
    }

    #[tokio::test]
    async fn test_forget_resets_history() {
        let smoother = StatusSmoother::new(3);
        feed(&smoother, 1, &[Occupied, Occupied, Occupied]).await;
        assert!(smoother.forget(1).await);
        assert!(!smoother.forget(1).await);

        assert_eq!(smoother.observe(1, Empty).await, Empty);
        assert_eq!(smoother.snapshot(1).await.unwrap().len(), 1);
    }
}
