//! RealtimeHub - WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - WebSocket connection management
//! - Slot update broadcasting (slot snapshot + detections of one cycle)
//! - Worker status notifications (worker stopped on its own)
//!
//! Delivery is best effort: a client whose channel is closed is skipped and
//! logged, never retried.

use crate::error::Result;
use crate::geometry::Point;
use crate::models::{CameraId, Detection, Slot, SlotId, SlotStatus};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Hub message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubMessage {
    /// Slot statuses after a reconciliation cycle
    SlotUpdate(SlotUpdate),
    /// Camera worker lifecycle change
    WorkerStatus(WorkerStatusMessage),
}

impl HubMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            HubMessage::SlotUpdate(_) => "slot_update",
            HubMessage::WorkerStatus(_) => "worker_status",
        }
    }
}

/// Slot as broadcast to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub label: String,
    pub polygon: Vec<Point>,
    pub status: SlotStatus,
}

impl From<&Slot> for SlotSnapshot {
    fn from(slot: &Slot) -> Self {
        Self {
            id: slot.id,
            label: slot.label.clone(),
            polygon: slot.polygon.clone(),
            status: slot.status,
        }
    }
}

/// Slot update message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotUpdate {
    pub camera_id: CameraId,
    pub slots: Vec<SlotSnapshot>,
    pub detections: Vec<Detection>,
    /// Frame the detections came from, for client-side video sync
    pub frame_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Worker status message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusMessage {
    pub camera_id: CameraId,
    pub running: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out seam used by the reconciliation pipeline
pub trait EventPublisher: Send + Sync {
    /// Broadcast a slot update
    fn publish(&self, update: SlotUpdate) -> BoxFuture<'_, Result<()>>;

    /// Announce a worker lifecycle change
    fn notify_worker(&self, status: WorkerStatusMessage) -> BoxFuture<'_, Result<()>> {
        let _ = status;
        async { Ok(()) }.boxed()
    }
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
    messages_sent: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::UnboundedReceiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, ClientConnection { id, tx });
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if connections.remove(id).is_some() {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(connection_id = %id, "Client disconnected");
        }
    }

    /// Broadcast message to all clients, returning how many received it
    pub async fn broadcast(&self, message: HubMessage) -> Result<usize> {
        let msg_type = message.type_name();
        let json = serde_json::to_string(&message)?;

        let connections = self.connections.read().await;
        tracing::debug!(
            message_type = %msg_type,
            client_count = connections.len(),
            "Broadcasting message to clients"
        );

        let mut delivered = 0;
        for conn in connections.values() {
            match conn.tx.send(json.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
                }
            }
        }

        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Number of messages broadcast so far
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPublisher for RealtimeHub {
    fn publish(&self, update: SlotUpdate) -> BoxFuture<'_, Result<()>> {
        async move {
            self.broadcast(HubMessage::SlotUpdate(update)).await?;
            Ok(())
        }
        .boxed()
    }

    fn notify_worker(&self, status: WorkerStatusMessage) -> BoxFuture<'_, Result<()>> {
        async move {
            self.broadcast(HubMessage::WorkerStatus(status)).await?;
            Ok(())
        }
        .boxed()
    }
}
