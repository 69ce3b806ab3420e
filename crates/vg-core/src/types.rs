use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AgentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Sleeping,
    Blocked,
    Offline,
}

impl AgentStatus {
    /// Statuses during which an agent owns a current task.
    /// `current_task_id` must be set exactly when this returns `true`.
    pub fn carries_task(&self) -> bool {
        matches!(self, AgentStatus::Working | AgentStatus::Blocked)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Sleeping => "sleeping",
            AgentStatus::Blocked => "blocked",
            AgentStatus::Offline => "offline",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    #[default]
    Primary,
    SubAgent,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    /// Back-reference for sub-agents; carries no ownership.
    pub parent_agent_id: Option<String>,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub skills: Vec<String>,
    pub config: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            kind: AgentKind::Primary,
            parent_agent_id: None,
            status: AgentStatus::Idle,
            current_task_id: None,
            last_heartbeat: None,
            skills: Vec::new(),
            config: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStatus / TaskPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled tasks never leave that status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::InProgress)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
                | (TaskStatus::Blocked, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// AgentTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub agent_id: String,
    pub linear_issue_id: Option<String>,
    pub project_id: Option<String>,
    pub title: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// Set exactly while `status == Blocked`, together with `blocked_at`.
    pub blocked_reason: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped once, on the transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        title: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            linear_issue_id: None,
            project_id: None,
            title: title.into(),
            status: TaskStatus::Pending,
            priority,
            blocked_reason: None,
            blocked_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertTrigger {
    Blocked,
    Completed,
    Error,
    IdleTooLong,
    StaleTask,
}

impl fmt::Display for AlertTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertTrigger::Blocked => "blocked",
            AlertTrigger::Completed => "completed",
            AlertTrigger::Error => "error",
            AlertTrigger::IdleTooLong => "idle_too_long",
            AlertTrigger::StaleTask => "stale_task",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityFilter {
    All,
    High,
    Medium,
    Low,
}

impl PriorityFilter {
    pub fn matches(&self, priority: TaskPriority) -> bool {
        match self {
            PriorityFilter::All => true,
            PriorityFilter::High => priority == TaskPriority::High,
            PriorityFilter::Medium => priority == TaskPriority::Medium,
            PriorityFilter::Low => priority == TaskPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    Push,
    InApp,
    Both,
}

impl AlertChannel {
    /// Channels that consume push budget when granted.
    pub fn wants_push(&self) -> bool {
        matches!(self, AlertChannel::Push | AlertChannel::Both)
    }
}

/// A static alerting policy. Rules are authored by the settings surface and
/// are read-only to the orchestration core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub trigger: AlertTrigger,
    pub priority_filter: PriorityFilter,
    pub delay_ms: u64,
    pub channel: AlertChannel,
    pub enabled: bool,
}

impl AlertRule {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn matches(&self, trigger: AlertTrigger, priority: TaskPriority) -> bool {
        self.enabled && self.trigger == trigger && self.priority_filter.matches(priority)
    }

    /// The authoritative starting configuration. Stores restore this set
    /// whenever the rules table is found empty.
    pub fn default_set() -> Vec<AlertRule> {
        let rule = |id: &str, trigger, priority_filter, delay_ms, channel| AlertRule {
            id: id.to_string(),
            trigger,
            priority_filter,
            delay_ms,
            channel,
            enabled: true,
        };
        vec![
            rule(
                "blocked-high",
                AlertTrigger::Blocked,
                PriorityFilter::High,
                0,
                AlertChannel::Both,
            ),
            rule(
                "blocked-medium",
                AlertTrigger::Blocked,
                PriorityFilter::Medium,
                600_000,
                AlertChannel::Both,
            ),
            rule(
                "blocked-low",
                AlertTrigger::Blocked,
                PriorityFilter::Low,
                3_600_000,
                AlertChannel::InApp,
            ),
            rule(
                "error-all",
                AlertTrigger::Error,
                PriorityFilter::All,
                0,
                AlertChannel::Both,
            ),
            rule(
                "completed-high",
                AlertTrigger::Completed,
                PriorityFilter::High,
                0,
                AlertChannel::InApp,
            ),
            rule(
                "completed-batch",
                AlertTrigger::Completed,
                PriorityFilter::All,
                900_000,
                AlertChannel::InApp,
            ),
            rule(
                "idle-all",
                AlertTrigger::IdleTooLong,
                PriorityFilter::All,
                1_800_000,
                AlertChannel::InApp,
            ),
            rule(
                "stale-all",
                AlertTrigger::StaleTask,
                PriorityFilter::All,
                7_200_000,
                AlertChannel::Push,
            ),
        ]
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A persisted notification. Created only by the alert fire/flush paths;
/// the core never mutates one after insertion apart from the read flag,
/// which belongs to the external inbox surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub kind: AlertTrigger,
    pub content: String,
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub project_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: AlertTrigger, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            content: content.into(),
            task_id: None,
            agent_id: None,
            project_id: None,
            read: false,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// AlertEvent — the sendNotification payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub trigger: AlertTrigger,
    pub agent_id: String,
    /// Absent for agent-level triggers such as `idle_too_long`.
    pub task_id: Option<String>,
    pub title: String,
    pub priority: TaskPriority,
    pub reason: Option<String>,
    pub project_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Orchestration inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentInput {
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub kind: AgentKind,
    pub parent_agent_id: Option<String>,
    pub soul_md: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTaskInput {
    pub agent_id: String,
    pub agent_name: String,
    pub task_id: String,
    pub title: String,
    pub priority: TaskPriority,
    #[serde(default)]
    pub agent_kind: AgentKind,
    pub parent_agent_id: Option<String>,
    pub soul_md: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    pub config: Option<serde_json::Value>,
    pub project_id: Option<String>,
    pub linear_issue_id: Option<String>,
}

impl StartTaskInput {
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        task_id: impl Into<String>,
        title: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            task_id: task_id.into(),
            title: title.into(),
            priority,
            agent_kind: AgentKind::Primary,
            parent_agent_id: None,
            soul_md: None,
            skills: Vec::new(),
            config: None,
            project_id: None,
            linear_issue_id: None,
        }
    }

    /// The registration half of a start request.
    pub fn register_input(&self) -> RegisterAgentInput {
        RegisterAgentInput {
            agent_id: self.agent_id.clone(),
            name: self.agent_name.clone(),
            kind: self.agent_kind,
            parent_agent_id: self.parent_agent_id.clone(),
            soul_md: self.soul_md.clone(),
            skills: self.skills.clone(),
            config: self.config.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
