use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, warn};

use vg_alerts::AlertScheduler;
use vg_bridge::protocol::{self, AgentStatusPayload, TaskUpdatePayload};
use vg_bridge::{BusEvent, EventBus};
use vg_core::retry::{retry, RetryError, RetryPolicy};
use vg_core::store::StateStore;
use vg_core::types::{
    Agent, AgentStatus, AgentTask, AlertEvent, RegisterAgentInput, StartTaskInput, TaskStatus,
};

use crate::monitor::{MonitorProbe, ProbeStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// The bounded retry budget for an activity was spent. Orchestrators
    /// surface this to their driver; it is never swallowed.
    #[error(transparent)]
    Exhausted(#[from] RetryError),
}

pub type Result<T> = std::result::Result<T, ActivityError>;

// ---------------------------------------------------------------------------
// Activities
// ---------------------------------------------------------------------------

/// The side-effecting operations the orchestrator is allowed to perform.
///
/// Every call is retried under the shared [`RetryPolicy`], so every handler
/// here is written to be idempotent: re-invocation with the same logical
/// arguments converges on the same stored state.
pub struct Activities {
    store: Arc<dyn StateStore>,
    scheduler: AlertScheduler,
    bus: EventBus,
    probe: Arc<dyn MonitorProbe>,
    retry: RetryPolicy,
}

impl Activities {
    pub fn new(
        store: Arc<dyn StateStore>,
        scheduler: AlertScheduler,
        bus: EventBus,
        probe: Arc<dyn MonitorProbe>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            scheduler,
            bus,
            probe,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // -----------------------------------------------------------------------
    // registerAgent
    // -----------------------------------------------------------------------

    /// Idempotent upsert of an agent record; a no-op when it already exists.
    pub async fn register_agent(&self, input: &RegisterAgentInput) -> Result<Agent> {
        let store = Arc::clone(&self.store);
        let input = input.clone();
        let (agent, created) = retry(&self.retry, "register_agent", move || {
            let store = Arc::clone(&store);
            let input = input.clone();
            async move {
                if let Some(existing) = store.get_agent(&input.agent_id).await? {
                    return Ok::<_, anyhow::Error>((existing, false));
                }
                let mut agent = Agent::new(&input.agent_id, &input.name);
                agent.kind = input.kind;
                agent.parent_agent_id = input.parent_agent_id.clone();
                agent.skills = input.skills.clone();
                agent.config = merge_soul(input.config.clone(), input.soul_md.as_deref());
                store.upsert_agent(&agent).await?;
                Ok((agent, true))
            }
        })
        .await?;

        if created {
            info!(agent_id = %agent.id, name = %agent.name, "agent registered");
            self.publish_agent(&agent, protocol::AGENT_REGISTERED);
        } else {
            debug!(agent_id = %agent.id, "agent already registered");
        }
        Ok(agent)
    }

    // -----------------------------------------------------------------------
    // startAgentTask
    // -----------------------------------------------------------------------

    /// Create the task record in `in_progress` and point the agent at it.
    /// Re-invocation converges: an existing task is reused and the agent
    /// pointer is reapplied.
    pub async fn start_task(&self, input: &StartTaskInput) -> Result<AgentTask> {
        let store = Arc::clone(&self.store);
        let input = input.clone();
        let (task, agent) = retry(&self.retry, "start_task", move || {
            let store = Arc::clone(&store);
            let input = input.clone();
            async move {
                let now = Utc::now();
                let task = match store.get_task(&input.task_id).await? {
                    Some(existing) => existing,
                    None => {
                        let mut task = AgentTask::new(
                            &input.task_id,
                            &input.agent_id,
                            &input.title,
                            input.priority,
                        );
                        task.status = TaskStatus::InProgress;
                        task.started_at = Some(now);
                        task.linear_issue_id = input.linear_issue_id.clone();
                        task.project_id = input.project_id.clone();
                        store.upsert_task(&task).await?;
                        task
                    }
                };

                let mut agent = store
                    .get_agent(&input.agent_id)
                    .await?
                    .ok_or_else(|| anyhow!("agent not found: {}", input.agent_id))?;
                agent.status = AgentStatus::Working;
                agent.current_task_id = Some(task.id.clone());
                agent.updated_at = now;
                store.upsert_agent(&agent).await?;

                Ok::<_, anyhow::Error>((task, agent))
            }
        })
        .await?;

        info!(task_id = %task.id, agent_id = %agent.id, title = %task.title, "task started");
        self.publish_task(&task);
        self.publish_agent(&agent, protocol::AGENT_STATUS_CHANGED);
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // monitorAgent
    // -----------------------------------------------------------------------

    pub async fn monitor(&self, agent_id: &str, task_id: &str) -> Result<ProbeStatus> {
        let probe = Arc::clone(&self.probe);
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        let status = retry(&self.retry, "monitor", move || {
            let probe = Arc::clone(&probe);
            let agent_id = agent_id.clone();
            let task_id = task_id.clone();
            async move { probe.probe(&agent_id, &task_id).await }
        })
        .await?;
        Ok(status)
    }

    // -----------------------------------------------------------------------
    // updateDashboard
    // -----------------------------------------------------------------------

    /// Persist an agent/task state transition, maintaining the record
    /// invariants: `current_task_id` is set exactly while the agent is
    /// working or blocked, the blocked fields exist exactly while the task
    /// is blocked, and `completed_at` is stamped once.
    pub async fn update_dashboard(
        &self,
        agent_id: &str,
        agent_status: AgentStatus,
        task_id: &str,
        task_status: Option<TaskStatus>,
        blocked_reason: Option<&str>,
    ) -> Result<()> {
        let store = Arc::clone(&self.store);
        let agent_id = agent_id.to_string();
        let task_id = task_id.to_string();
        let blocked_reason = blocked_reason.map(str::to_string);

        let (agent, task) = retry(&self.retry, "update_dashboard", move || {
            let store = Arc::clone(&store);
            let agent_id = agent_id.clone();
            let task_id = task_id.clone();
            let blocked_reason = blocked_reason.clone();
            async move {
                let now = Utc::now();

                let mut agent = store
                    .get_agent(&agent_id)
                    .await?
                    .ok_or_else(|| anyhow!("agent not found: {agent_id}"))?;
                agent.status = agent_status;
                agent.current_task_id = if agent_status.carries_task() {
                    Some(task_id.clone())
                } else {
                    None
                };
                agent.updated_at = now;
                store.upsert_agent(&agent).await?;

                let mut task_out = None;
                if let Some(next) = task_status {
                    let mut task = store
                        .get_task(&task_id)
                        .await?
                        .ok_or_else(|| anyhow!("task not found: {task_id}"))?;
                    if task.status.is_terminal() && task.status != next {
                        warn!(
                            task_id = %task.id,
                            current = %task.status,
                            requested = %next,
                            "ignoring transition out of terminal status"
                        );
                    } else {
                        task.status = next;
                        match next {
                            TaskStatus::Blocked => {
                                task.blocked_reason = Some(
                                    blocked_reason
                                        .clone()
                                        .unwrap_or_else(|| "unknown".to_string()),
                                );
                                if task.blocked_at.is_none() {
                                    task.blocked_at = Some(now);
                                }
                            }
                            _ => {
                                task.blocked_reason = None;
                                task.blocked_at = None;
                            }
                        }
                        if next == TaskStatus::InProgress && task.started_at.is_none() {
                            task.started_at = Some(now);
                        }
                        if next.is_terminal() && task.completed_at.is_none() {
                            task.completed_at = Some(now);
                        }
                        task.updated_at = now;
                        store.upsert_task(&task).await?;
                    }
                    task_out = Some(task);
                }

                Ok::<_, anyhow::Error>((agent, task_out))
            }
        })
        .await?;

        debug!(
            agent_id = %agent.id,
            status = %agent.status,
            task_status = ?task.as_ref().map(|t| t.status),
            "dashboard updated"
        );
        self.publish_agent(&agent, protocol::AGENT_STATUS_CHANGED);
        if let Some(task) = &task {
            self.publish_task(task);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // sendNotification
    // -----------------------------------------------------------------------

    /// Route an alert event into the scheduler. Safe to re-invoke: a
    /// repeated event lands on the same debounce keys.
    pub async fn send_notification(&self, event: AlertEvent) -> Result<()> {
        let scheduler = self.scheduler.clone();
        retry(&self.retry, "send_notification", move || {
            let scheduler = scheduler.clone();
            let event = event.clone();
            async move { scheduler.process_event(event).await }
        })
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // cancelAlerts
    // -----------------------------------------------------------------------

    /// Cancel pending alert timers for an agent (and task, if given).
    pub async fn cancel_alerts(&self, agent_id: &str, task_id: Option<&str>) -> Result<usize> {
        Ok(self.scheduler.cancel_pending(agent_id, task_id).await)
    }

    // -----------------------------------------------------------------------
    // Bus helpers
    // -----------------------------------------------------------------------

    fn publish_agent(&self, agent: &Agent, event_type: &str) {
        let payload = AgentStatusPayload {
            agent_id: agent.id.clone(),
            status: agent.status,
            current_task_id: agent.current_task_id.clone(),
        };
        if let Ok(value) = serde_json::to_value(&payload) {
            self.bus.publish(BusEvent::new(event_type, value));
        }
    }

    fn publish_task(&self, task: &AgentTask) {
        let payload = TaskUpdatePayload {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            status: task.status,
            blocked_reason: task.blocked_reason.clone(),
        };
        if let Ok(value) = serde_json::to_value(&payload) {
            self.bus.publish(BusEvent::new(protocol::TASK_UPDATED, value));
        }
    }
}

/// Fold the optional soul document into the agent's config blob.
fn merge_soul(
    config: Option<serde_json::Value>,
    soul_md: Option<&str>,
) -> Option<serde_json::Value> {
    match (config, soul_md) {
        (cfg, None) => cfg,
        (None, Some(soul)) => Some(serde_json::json!({ "soul_md": soul })),
        (Some(serde_json::Value::Object(mut map)), Some(soul)) => {
            map.insert(
                "soul_md".to_string(),
                serde_json::Value::String(soul.to_string()),
            );
            Some(serde_json::Value::Object(map))
        }
        // A non-object config is left untouched.
        (Some(other), Some(_)) => Some(other),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
