use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vg_core::types::{AgentStatus, AlertChannel, AlertEvent, AlertTrigger, TaskStatus};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

pub const AGENT_REGISTERED: &str = "agent_registered";
pub const AGENT_STATUS_CHANGED: &str = "agent_status_changed";
pub const TASK_UPDATED: &str = "task_updated";
pub const NOTIFICATION: &str = "notification";

// ---------------------------------------------------------------------------
// BusEvent
// ---------------------------------------------------------------------------

/// The envelope broadcast to live dashboards. Delivery is best-effort; the
/// core assumes nothing beyond publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusPayload {
    pub agent_id: String,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdatePayload {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub blocked_reason: Option<String>,
}

/// Published whenever a notification message is persisted. `alert` carries
/// the originating event for non-batch deliveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub message_id: Uuid,
    pub kind: AlertTrigger,
    pub content: String,
    pub channel: AlertChannel,
    pub batch: bool,
    pub alert: Option<AlertEvent>,
}
