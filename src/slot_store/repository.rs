//! SlotStore Repository
//!
//! MySQL access layer for slots, slot events and camera stream descriptors

use super::SlotStore;
use crate::error::{Error, Result};
use crate::geometry::Point;
use crate::models::{CameraId, Slot, SlotEvent, SlotId, SlotStatus};
use crate::slot_reconciler::SlotStatusUpdate;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::types::Json;
use sqlx::MySqlPool;

/// Database row for slots
#[derive(Debug, sqlx::FromRow)]
struct SlotRow {
    id: i64,
    camera_id: i64,
    label: String,
    polygon: Json<Vec<Point>>,
    status: String,
    last_changed_at: DateTime<Utc>,
}

impl SlotRow {
    fn into_slot(self) -> Option<Slot> {
        let Some(status) = SlotStatus::from_str(&self.status) else {
            tracing::warn!(
                slot_id = self.id,
                status = %self.status,
                "Skipping slot with unknown status"
            );
            return None;
        };

        Some(Slot {
            id: self.id,
            camera_id: self.camera_id,
            label: self.label,
            polygon: self.polygon.0,
            status,
            last_changed_at: self.last_changed_at,
        })
    }
}

/// MySQL-backed slot store
#[derive(Clone)]
pub struct MySqlSlotStore {
    pool: MySqlPool,
}

impl MySqlSlotStore {
    /// Slot SELECT columns
    const SLOT_COLUMNS: &'static str = "id, camera_id, label, polygon, status, last_changed_at";

    /// Create new repository
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn fetch_slots(&self, camera_id: CameraId) -> Result<Vec<Slot>> {
        let query = format!(
            "SELECT {} FROM slots WHERE camera_id = ? ORDER BY id",
            Self::SLOT_COLUMNS
        );
        let rows = sqlx::query_as::<_, SlotRow>(&query)
            .bind(camera_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().filter_map(SlotRow::into_slot).collect())
    }

    async fn fetch_slots_by_ids(&self, ids: &[SlotId]) -> Result<Vec<Slot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!(
            "SELECT {} FROM slots WHERE id IN ({}) ORDER BY id",
            Self::SLOT_COLUMNS,
            placeholders
        );

        let mut q = sqlx::query_as::<_, SlotRow>(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().filter_map(SlotRow::into_slot).collect())
    }

    async fn commit_cycle(&self, updates: &[SlotStatusUpdate], events: &[SlotEvent]) -> Result<()> {
        if updates.is_empty() && events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query("UPDATE slots SET status = ?, last_changed_at = ? WHERE id = ?")
                .bind(update.status.as_str())
                .bind(update.changed_at)
                .bind(update.slot_id)
                .execute(&mut *tx)
                .await?;
        }

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO slot_events (slot_id, old_status, new_status, start_time)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(event.slot_id)
            .bind(event.old_status.as_str())
            .bind(event.new_status.as_str())
            .bind(event.start_time)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("commit failed: {}", e)))?;

        tracing::debug!(
            updates = updates.len(),
            events = events.len(),
            "Slot cycle committed"
        );
        Ok(())
    }

    async fn fetch_camera_source(&self, camera_id: CameraId) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT stream_url FROM cameras WHERE id = ?")
            .bind(camera_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(url,)| url))
    }
}

impl SlotStore for MySqlSlotStore {
    fn get_slots(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Vec<Slot>>> {
        self.fetch_slots(camera_id).boxed()
    }

    fn get_slots_by_ids<'a>(&'a self, ids: &'a [SlotId]) -> BoxFuture<'a, Result<Vec<Slot>>> {
        self.fetch_slots_by_ids(ids).boxed()
    }

    fn commit<'a>(
        &'a self,
        updates: &'a [SlotStatusUpdate],
        events: &'a [SlotEvent],
    ) -> BoxFuture<'a, Result<()>> {
        self.commit_cycle(updates, events).boxed()
    }

    fn camera_source(&self, camera_id: CameraId) -> BoxFuture<'_, Result<Option<String>>> {
        self.fetch_camera_source(camera_id).boxed()
    }
}
