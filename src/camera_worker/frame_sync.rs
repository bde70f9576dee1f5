//! Frame-sync ring buffer
//!
//! Records which captured frames were sent through inference. Fixed capacity,
//! oldest entries dropped first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Default number of tracked frames
pub const DEFAULT_FRAME_SYNC_CAPACITY: usize = 60;

/// One captured frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRecord {
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
}

/// Bounded FIFO of frame records
#[derive(Debug)]
pub struct FrameSyncBuffer {
    records: VecDeque<FrameRecord>,
    capacity: usize,
}

impl FrameSyncBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame_id: u64, timestamp: DateTime<Utc>) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(FrameRecord {
            frame_id,
            timestamp,
            processed: false,
        });
    }

    /// Mark a frame processed; false if it already fell out of the buffer
    pub fn mark_processed(&mut self, frame_id: u64) -> bool {
        match self.records.iter_mut().rev().find(|r| r.frame_id == frame_id) {
            Some(record) => {
                record.processed = true;
                true
            }
            None => false,
        }
    }

    pub fn processed(&self) -> usize {
        self.records.iter().filter(|r| r.processed).count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&FrameRecord> {
        self.records.back()
    }
}
