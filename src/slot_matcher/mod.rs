//! SlotMatcher - Detection to Slot Assignment
//!
//! ## Responsibilities
//!
//! - Score every detection against every slot polygon (overlap ratio)
//! - Attribute each detection to at most one slot
//! - Produce the raw per-cycle occupancy of every known slot
//!
//! Pure: no I/O, no shared state. Safe to call concurrently for different cameras.

use crate::geometry::{self, BBox};
use crate::models::{Detection, Occupancy, Slot, SlotId};
use std::collections::BTreeMap;

/// Default minimum overlap ratio for a detection to occupy a slot
pub const DEFAULT_OVERLAP_THRESHOLD: f64 = 0.3;

/// Raw occupancy of each slot for one cycle
pub type SlotStatusAssignment = BTreeMap<SlotId, Occupancy>;

/// Best slot for a single box, with its overlap ratio
///
/// Slots are scanned in input order and only a strictly greater ratio replaces the
/// current best, so ties go to the earlier slot. Slots with unusable polygons are
/// ignored.
pub fn best_slot<'a>(bbox: &BBox, slots: &'a [Slot]) -> Option<(&'a Slot, f64)> {
    let mut best: Option<(&Slot, f64)> = None;

    for slot in slots {
        if !geometry::is_usable_polygon(&slot.polygon) {
            continue;
        }
        let ratio = geometry::overlap_ratio(bbox, &slot.polygon);
        match best {
            Some((_, best_ratio)) if ratio <= best_ratio => {}
            _ => best = Some((slot, ratio)),
        }
    }

    best
}

/// Assign detections to slots
///
/// Every slot starts Empty and becomes Occupied only when some detection's best slot
/// reaches `threshold`.
pub fn match_detections(
    slots: &[Slot],
    detections: &[Detection],
    threshold: f64,
) -> SlotStatusAssignment {
    let mut assignment: SlotStatusAssignment =
        slots.iter().map(|s| (s.id, Occupancy::Empty)).collect();

    for slot in slots {
        if !geometry::is_usable_polygon(&slot.polygon) {
            tracing::warn!(
                slot_id = slot.id,
                points = slot.polygon.len(),
                "Skipping slot with unusable polygon"
            );
        }
    }

    for detection in detections {
        if !detection.bbox.is_valid() {
            tracing::warn!(
                frame_id = detection.frame_id,
                bbox = ?detection.bbox,
                "Skipping detection with invalid bbox"
            );
            continue;
        }

        if let Some((slot, ratio)) = best_slot(&detection.bbox, slots) {
            if ratio >= threshold {
                assignment.insert(slot.id, Occupancy::Occupied);
                tracing::trace!(
                    slot_id = slot.id,
                    ratio = ratio,
                    class_label = %detection.class_label,
                    "Detection attributed to slot"
                );
            }
        }
    }

    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::models::SlotStatus;
    use chrono::Utc;

    fn slot(id: SlotId, x: f64, y: f64, size: f64) -> Slot {
        Slot {
            id,
            camera_id: 1,
            label: format!("S{}", id),
            polygon: vec![
                Point::new(x, y),
                Point::new(x + size, y),
                Point::new(x + size, y + size),
                Point::new(x, y + size),
            ],
            status: SlotStatus::Empty,
            last_changed_at: Utc::now(),
        }
    }

    fn detection(x: f64, y: f64, w: f64, h: f64) -> Detection {
        Detection {
            bbox: BBox::new(x, y, w, h),
            confidence: 0.9,
            class_label: "car".to_string(),
            frame_id: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_detection_inside_slot_marks_occupied() {
        let slots = vec![slot(1, 0.0, 0.0, 100.0)];
        let dets = vec![detection(10.0, 10.0, 80.0, 80.0)];

        let result = match_detections(&slots, &dets, DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
    }

    #[test]
    fn test_below_threshold_stays_empty() {
        let slots = vec![slot(1, 0.0, 0.0, 20.0)];
        // Ratio 0.25
        let dets = vec![detection(5.0, 5.0, 10.0, 10.0)];

        let result = match_detections(&slots, &dets, DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(result.get(&1), Some(&Occupancy::Empty));

        let result = match_detections(&slots, &dets, 0.25);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
    }

    #[test]
    fn test_all_slots_default_empty() {
        let slots = vec![slot(1, 0.0, 0.0, 10.0), slot(2, 100.0, 0.0, 10.0)];
        let result = match_detections(&slots, &[], DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(result.len(), 2);
        assert!(result.values().all(|o| *o == Occupancy::Empty));
    }

    #[test]
    fn test_detection_attributed_to_single_best_slot() {
        // Box covers all of slot 2 and a small part of slot 1
        let slots = vec![slot(1, 0.0, 0.0, 10.0), slot(2, 10.0, 0.0, 10.0)];
        let dets = vec![detection(8.0, 0.0, 12.0, 10.0)];

        let result = match_detections(&slots, &dets, 0.1);
        assert_eq!(result.get(&1), Some(&Occupancy::Empty));
        assert_eq!(result.get(&2), Some(&Occupancy::Occupied));
    }

    #[test]
    fn test_tie_goes_to_first_slot() {
        let slots = vec![slot(1, 0.0, 0.0, 10.0), slot(2, 10.0, 0.0, 10.0)];
        // Half of each slot
        let dets = vec![detection(5.0, 0.0, 10.0, 10.0)];

        let result = match_detections(&slots, &dets, DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
        assert_eq!(result.get(&2), Some(&Occupancy::Empty));
    }

    #[test]
    fn test_invalid_inputs_are_skipped() {
        let mut degenerate = slot(2, 0.0, 0.0, 10.0);
        degenerate.polygon.truncate(2);
        let slots = vec![slot(1, 0.0, 0.0, 10.0), degenerate];
        let dets = vec![detection(0.0, 0.0, 0.0, 10.0), detection(0.0, 0.0, 10.0, 10.0)];

        let result = match_detections(&slots, &dets, DEFAULT_OVERLAP_THRESHOLD);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
        assert_eq!(result.get(&2), Some(&Occupancy::Empty));
    }

    #[test]
    fn test_zero_threshold_selects_zero_area_slot() {
        let mut flat = slot(1, 0.0, 0.0, 10.0);
        flat.polygon = vec![Point::new(0.0, 0.0), Point::new(5.0, 0.0), Point::new(10.0, 0.0)];
        let slots = vec![flat];
        let dets = vec![detection(50.0, 50.0, 5.0, 5.0)];

        let result = match_detections(&slots, &dets, 0.0);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
    }

    #[test]
    fn test_zero_threshold_attributes_disjoint_box() {
        let slots = vec![slot(1, 0.0, 0.0, 10.0), slot(2, 20.0, 0.0, 10.0)];
        let dets = vec![detection(1000.0, 1000.0, 10.0, 10.0)];

        // Ratio 0 still meets a zero threshold; first slot wins the tie
        let result = match_detections(&slots, &dets, 0.0);
        assert_eq!(result.get(&1), Some(&Occupancy::Occupied));
        assert_eq!(result.get(&2), Some(&Occupancy::Empty));

        let result = match_detections(&slots, &dets, DEFAULT_OVERLAP_THRESHOLD);
        assert!(result.values().all(|o| *o == Occupancy::Empty));
    }
}
