//! Shared models and types for lotwatch
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use crate::error::{Error, Result};
use crate::geometry::{BBox, Point};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera identifier
pub type CameraId = i64;

/// Slot identifier
pub type SlotId = i64;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
        }
    }
}

/// Persisted slot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Empty,
    Occupied,
    Reserved,
    Disabled,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Empty => "empty",
            SlotStatus::Occupied => "occupied",
            SlotStatus::Reserved => "reserved",
            SlotStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Some(SlotStatus::Empty),
            "occupied" => Some(SlotStatus::Occupied),
            "reserved" => Some(SlotStatus::Reserved),
            "disabled" => Some(SlotStatus::Disabled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cycle classification of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Occupancy {
    Empty,
    Occupied,
}

impl From<Occupancy> for SlotStatus {
    fn from(o: Occupancy) -> Self {
        match o {
            Occupancy::Empty => SlotStatus::Empty,
            Occupancy::Occupied => SlotStatus::Occupied,
        }
    }
}

/// Parking slot as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub camera_id: CameraId,
    pub label: String,
    pub polygon: Vec<Point>,
    pub status: SlotStatus,
    pub last_changed_at: DateTime<Utc>,
}

/// Slot status transition log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEvent {
    pub slot_id: SlotId,
    pub old_status: SlotStatus,
    pub new_status: SlotStatus,
    pub start_time: DateTime<Utc>,
}

/// Validated vehicle detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub confidence: f64,
    pub class_label: String,
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// Detector output before validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDetection {
    /// `[x, y, width, height]`
    pub bbox: Vec<f64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(alias = "class", alias = "label")]
    pub class_name: String,
}

impl RawDetection {
    /// Validate and tag with the frame it was taken from
    pub fn validate(self, frame_id: u64, timestamp: DateTime<Utc>) -> Result<Detection> {
        let [x, y, width, height]: [f64; 4] = self.bbox.as_slice().try_into().map_err(|_| {
            Error::Validation(format!(
                "bbox must have 4 components, got {}",
                self.bbox.len()
            ))
        })?;

        let bbox = BBox::new(x, y, width, height);
        if !bbox.is_valid() {
            return Err(Error::Validation(format!(
                "bbox must be finite with positive extent: {:?}",
                self.bbox
            )));
        }

        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Validation(format!(
                "confidence out of range: {}",
                self.confidence
            )));
        }

        Ok(Detection {
            bbox,
            confidence: self.confidence,
            class_label: self.class_name,
            frame_id,
            timestamp,
        })
    }
}

/// Per-camera slot counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancySummary {
    pub camera_id: CameraId,
    pub total: usize,
    pub empty: usize,
    pub occupied: usize,
    pub reserved: usize,
    pub disabled: usize,
}

impl OccupancySummary {
    /// Count slots by status
    pub fn from_slots(camera_id: CameraId, slots: &[Slot]) -> Self {
        let mut summary = Self {
            camera_id,
            total: slots.len(),
            ..Default::default()
        };
        for slot in slots {
            match slot.status {
                SlotStatus::Empty => summary.empty += 1,
                SlotStatus::Occupied => summary.occupied += 1,
                SlotStatus::Reserved => summary.reserved += 1,
                SlotStatus::Disabled => summary.disabled += 1,
            }
        }
        summary
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub active_workers: usize,
    pub detector_connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bbox: Vec<f64>, confidence: f64) -> RawDetection {
        RawDetection {
            bbox,
            confidence,
            class_name: "car".to_string(),
        }
    }

    #[test]
    fn test_slot_status_round_trip_str() {
        for status in [
            SlotStatus::Empty,
            SlotStatus::Occupied,
            SlotStatus::Reserved,
            SlotStatus::Disabled,
        ] {
            assert_eq!(SlotStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SlotStatus::from_str("Occupied "), Some(SlotStatus::Occupied));
        assert_eq!(SlotStatus::from_str("parked"), None);
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        let now = Utc::now();
        let d = raw(vec![10.0, 20.0, 30.0, 40.0], 0.9).validate(7, now).unwrap();
        assert_eq!(d.bbox, BBox::new(10.0, 20.0, 30.0, 40.0));
        assert_eq!(d.frame_id, 7);
        assert_eq!(d.class_label, "car");
    }

    #[test]
    fn test_validate_rejects_malformed() {
        let now = Utc::now();
        assert!(raw(vec![1.0, 2.0, 3.0], 0.5).validate(0, now).is_err());
        assert!(raw(vec![0.0, 0.0, 0.0, 10.0], 0.5).validate(0, now).is_err());
        assert!(raw(vec![0.0, 0.0, 10.0, f64::INFINITY], 0.5)
            .validate(0, now)
            .is_err());
        assert!(raw(vec![0.0, 0.0, 10.0, 10.0], 1.5).validate(0, now).is_err());
    }

    #[test]
    fn test_raw_detection_accepts_class_alias() {
        let r: RawDetection =
            serde_json::from_str(r#"{"bbox":[1,2,3,4],"confidence":0.8,"class":"truck"}"#).unwrap();
        assert_eq!(r.class_name, "truck");
    }

    #[test]
    fn test_occupancy_summary() {
        let now = Utc::now();
        let slot = |id, status| Slot {
            id,
            camera_id: 1,
            label: format!("A{}", id),
            polygon: vec![],
            status,
            last_changed_at: now,
        };
        let slots = vec![
            slot(1, SlotStatus::Empty),
            slot(2, SlotStatus::Occupied),
            slot(3, SlotStatus::Occupied),
            slot(4, SlotStatus::Disabled),
        ];
        let summary = OccupancySummary::from_slots(1, &slots);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.empty, 1);
        assert_eq!(summary.occupied, 2);
        assert_eq!(summary.reserved, 0);
        assert_eq!(summary.disabled, 1);
    }
}
