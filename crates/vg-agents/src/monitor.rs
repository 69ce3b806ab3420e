use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use vg_core::store::{Result, StateStore};
use vg_core::types::TaskStatus;

// ---------------------------------------------------------------------------
// ProbeStatus
// ---------------------------------------------------------------------------

/// A single point-in-time read of agent/task reality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Working,
    Completed,
    Blocked { reason: String },
    Error { reason: String },
}

// ---------------------------------------------------------------------------
// MonitorProbe
// ---------------------------------------------------------------------------

/// How the orchestrator observes its task. The store-backed implementation
/// below is the default; tests substitute scripted probes.
#[async_trait]
pub trait MonitorProbe: Send + Sync {
    async fn probe(&self, agent_id: &str, task_id: &str) -> Result<ProbeStatus>;
}

// ---------------------------------------------------------------------------
// StoreMonitorProbe
// ---------------------------------------------------------------------------

/// Maps the persisted task status straight onto a probe result, refreshing
/// the agent heartbeat as a side effect. Missing records are reported as
/// `error` results, never as store failures.
pub struct StoreMonitorProbe {
    store: Arc<dyn StateStore>,
}

impl StoreMonitorProbe {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MonitorProbe for StoreMonitorProbe {
    async fn probe(&self, agent_id: &str, task_id: &str) -> Result<ProbeStatus> {
        let Some(mut agent) = self.store.get_agent(agent_id).await? else {
            return Ok(ProbeStatus::Error {
                reason: "Agent not found".to_string(),
            });
        };
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(ProbeStatus::Error {
                reason: "Task not found".to_string(),
            });
        };

        agent.last_heartbeat = Some(Utc::now());
        self.store.upsert_agent(&agent).await?;

        let status = match task.status {
            TaskStatus::Pending | TaskStatus::InProgress => ProbeStatus::Working,
            TaskStatus::Completed => ProbeStatus::Completed,
            TaskStatus::Blocked => ProbeStatus::Blocked {
                reason: task
                    .blocked_reason
                    .unwrap_or_else(|| "unknown".to_string()),
            },
            // Cancelled externally, out from under the orchestrator.
            TaskStatus::Cancelled => ProbeStatus::Error {
                reason: "Task was cancelled".to_string(),
            },
        };
        Ok(status)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
