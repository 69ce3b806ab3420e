//! Persistence contract consumed by the orchestration and alerting layers.
//!
//! The core never talks to storage directly; everything goes through
//! [`StateStore`]. Two implementations ship here: [`MemoryStore`] for tests
//! and embedding, and the SQLite-backed [`StoreDb`].

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{Agent, AgentTask, AlertRule, AlertTrigger, Message, TaskPriority};

mod db;
mod memory;

pub use db::StoreDb;
pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// CRUD access to agents, tasks, alert rules, and messages.
///
/// All writes are upserts keyed by id, so every operation is idempotent
/// under at-least-once re-invocation — activity handlers rely on this.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    async fn get_task(&self, id: &str) -> Result<Option<AgentTask>>;
    async fn upsert_task(&self, task: &AgentTask) -> Result<()>;

    async fn get_alert_rule(&self, id: &str) -> Result<Option<AlertRule>>;
    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()>;
    async fn list_alert_rules(&self) -> Result<Vec<AlertRule>>;

    /// Enabled rules whose trigger matches and whose priority filter is
    /// `all` or equal to `priority`. `None` matches on trigger alone.
    async fn alert_rules_for_trigger(
        &self,
        trigger: AlertTrigger,
        priority: Option<TaskPriority>,
    ) -> Result<Vec<AlertRule>> {
        let rules = self.list_alert_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| {
                r.enabled
                    && r.trigger == trigger
                    && priority.map_or(true, |p| r.priority_filter.matches(p))
            })
            .collect())
    }

    async fn insert_message(&self, message: &Message) -> Result<()>;
    async fn list_messages(&self) -> Result<Vec<Message>>;

    /// Flips the read flag. Returns `false` when the message is unknown.
    async fn mark_message_read(&self, id: Uuid) -> Result<bool>;
}
