use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use super::{Result, StateStore, StoreError};
use crate::types::{Agent, AgentTask, AlertRule, AlertTrigger, Message, TaskPriority};

/// Async SQLite-backed [`StateStore`] for agents, tasks, rules, and messages.
pub struct StoreDb {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn datetime_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

impl StoreDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        db.restore_default_rules_if_empty().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        db.restore_default_rules_if_empty().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agents (
                        id              TEXT PRIMARY KEY,
                        name            TEXT NOT NULL,
                        kind            TEXT NOT NULL,
                        parent_agent_id TEXT,
                        status          TEXT NOT NULL,
                        current_task_id TEXT,
                        last_heartbeat  TEXT,
                        skills          TEXT NOT NULL,
                        config          TEXT,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

                    CREATE TABLE IF NOT EXISTS tasks (
                        id              TEXT PRIMARY KEY,
                        agent_id        TEXT NOT NULL,
                        linear_issue_id TEXT,
                        project_id      TEXT,
                        title           TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        priority        TEXT NOT NULL,
                        blocked_reason  TEXT,
                        blocked_at      TEXT,
                        started_at      TEXT,
                        completed_at    TEXT,
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
                    CREATE INDEX IF NOT EXISTS idx_tasks_agent  ON tasks(agent_id);

                    CREATE TABLE IF NOT EXISTS alert_rules (
                        id              TEXT PRIMARY KEY,
                        trigger         TEXT NOT NULL,
                        priority_filter TEXT NOT NULL,
                        delay_ms        INTEGER NOT NULL,
                        channel         TEXT NOT NULL,
                        enabled         INTEGER NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS messages (
                        id          TEXT PRIMARY KEY,
                        kind        TEXT NOT NULL,
                        content     TEXT NOT NULL,
                        task_id     TEXT,
                        agent_id    TEXT,
                        project_id  TEXT,
                        read        INTEGER NOT NULL DEFAULT 0,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    /// Seed the authoritative default rule set when the table is empty,
    /// so a fresh deployment alerts sensibly out of the box.
    async fn restore_default_rules_if_empty(&self) -> Result<()> {
        let count: i64 = self
            .conn
            .call(|conn| {
                let n = conn
                    .prepare("SELECT COUNT(*) FROM alert_rules")?
                    .query_row([], |r| r.get(0))?;
                Ok(n)
            })
            .await?;

        if count == 0 {
            tracing::info!("alert_rules table empty — restoring default rule set");
            for rule in AlertRule::default_set() {
                self.upsert_alert_rule(&rule).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for StoreDb {
    // -----------------------------------------------------------------------
    // Agent CRUD
    // -----------------------------------------------------------------------

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, parent_agent_id, status, current_task_id,
                            last_heartbeat, skills, config, created_at, updated_at
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let id = agent.id.clone();
        let name = agent.name.clone();
        let kind = enum_to_sql(&agent.kind);
        let parent = agent.parent_agent_id.clone();
        let status = enum_to_sql(&agent.status);
        let current_task_id = agent.current_task_id.clone();
        let last_heartbeat = agent.last_heartbeat.map(|d| d.to_rfc3339());
        let skills = serde_json::to_string(&agent.skills)?;
        let config = agent.config.as_ref().map(|v| v.to_string());
        let created_at = agent.created_at.to_rfc3339();
        let updated_at = agent.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, kind, parent_agent_id, status,
                        current_task_id, last_heartbeat, skills, config, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, kind=excluded.kind,
                        parent_agent_id=excluded.parent_agent_id, status=excluded.status,
                        current_task_id=excluded.current_task_id,
                        last_heartbeat=excluded.last_heartbeat, skills=excluded.skills,
                        config=excluded.config, updated_at=excluded.updated_at",
                    rusqlite::params![
                        id,
                        name,
                        kind,
                        parent,
                        status,
                        current_task_id,
                        last_heartbeat,
                        skills,
                        config,
                        created_at,
                        updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, parent_agent_id, status, current_task_id,
                            last_heartbeat, skills, config, created_at, updated_at
                     FROM agents ORDER BY created_at",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    async fn get_task(&self, id: &str) -> Result<Option<AgentTask>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_id, linear_issue_id, project_id, title, status,
                            priority, blocked_reason, blocked_at, started_at, completed_at,
                            created_at, updated_at
                     FROM tasks WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    async fn upsert_task(&self, task: &AgentTask) -> Result<()> {
        let id = task.id.clone();
        let agent_id = task.agent_id.clone();
        let linear_issue_id = task.linear_issue_id.clone();
        let project_id = task.project_id.clone();
        let title = task.title.clone();
        let status = enum_to_sql(&task.status);
        let priority = enum_to_sql(&task.priority);
        let blocked_reason = task.blocked_reason.clone();
        let blocked_at = task.blocked_at.map(|d| d.to_rfc3339());
        let started_at = task.started_at.map(|d| d.to_rfc3339());
        let completed_at = task.completed_at.map(|d| d.to_rfc3339());
        let created_at = task.created_at.to_rfc3339();
        let updated_at = task.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, agent_id, linear_issue_id, project_id, title,
                        status, priority, blocked_reason, blocked_at, started_at,
                        completed_at, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
                     ON CONFLICT(id) DO UPDATE SET
                        agent_id=excluded.agent_id, linear_issue_id=excluded.linear_issue_id,
                        project_id=excluded.project_id, title=excluded.title,
                        status=excluded.status, priority=excluded.priority,
                        blocked_reason=excluded.blocked_reason, blocked_at=excluded.blocked_at,
                        started_at=excluded.started_at, completed_at=excluded.completed_at,
                        updated_at=excluded.updated_at",
                    rusqlite::params![
                        id,
                        agent_id,
                        linear_issue_id,
                        project_id,
                        title,
                        status,
                        priority,
                        blocked_reason,
                        blocked_at,
                        started_at,
                        completed_at,
                        created_at,
                        updated_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    // -----------------------------------------------------------------------
    // Alert rule CRUD
    // -----------------------------------------------------------------------

    async fn get_alert_rule(&self, id: &str) -> Result<Option<AlertRule>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, trigger, priority_filter, delay_ms, channel, enabled
                     FROM alert_rules WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_rule(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::from)
    }

    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        let id = rule.id.clone();
        let trigger = enum_to_sql(&rule.trigger);
        let priority_filter = enum_to_sql(&rule.priority_filter);
        let delay_ms = rule.delay_ms as i64;
        let channel = enum_to_sql(&rule.channel);
        let enabled = rule.enabled as i64;

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO alert_rules (id, trigger, priority_filter, delay_ms,
                        channel, enabled)
                     VALUES (?1,?2,?3,?4,?5,?6)
                     ON CONFLICT(id) DO UPDATE SET
                        trigger=excluded.trigger, priority_filter=excluded.priority_filter,
                        delay_ms=excluded.delay_ms, channel=excluded.channel,
                        enabled=excluded.enabled",
                    rusqlite::params![id, trigger, priority_filter, delay_ms, channel, enabled],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn list_alert_rules(&self) -> Result<Vec<AlertRule>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, trigger, priority_filter, delay_ms, channel, enabled
                     FROM alert_rules ORDER BY id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_rule(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn alert_rules_for_trigger(
        &self,
        trigger: AlertTrigger,
        priority: Option<TaskPriority>,
    ) -> Result<Vec<AlertRule>> {
        let trigger_str = enum_to_sql(&trigger);
        let rules: Vec<AlertRule> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, trigger, priority_filter, delay_ms, channel, enabled
                     FROM alert_rules WHERE trigger = ?1 AND enabled = 1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![trigger_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_rule(row)?);
                }
                Ok(out)
            })
            .await?;

        Ok(rules
            .into_iter()
            .filter(|r| priority.map_or(true, |p| r.priority_filter.matches(p)))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Message CRUD
    // -----------------------------------------------------------------------

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let id = message.id.to_string();
        let kind = enum_to_sql(&message.kind);
        let content = message.content.clone();
        let task_id = message.task_id.clone();
        let agent_id = message.agent_id.clone();
        let project_id = message.project_id.clone();
        let read = message.read as i64;
        let created_at = message.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO messages (id, kind, content, task_id, agent_id,
                        project_id, read, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                     ON CONFLICT(id) DO UPDATE SET
                        kind=excluded.kind, content=excluded.content,
                        task_id=excluded.task_id, agent_id=excluded.agent_id,
                        project_id=excluded.project_id",
                    rusqlite::params![
                        id, kind, content, task_id, agent_id, project_id, read, created_at,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::from)
    }

    async fn list_messages(&self) -> Result<Vec<Message>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, kind, content, task_id, agent_id, project_id, read, created_at
                     FROM messages ORDER BY created_at",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_message(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn mark_message_read(&self, id: Uuid) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let changed =
                    conn.execute("UPDATE messages SET read = 1 WHERE id = ?1", [id])?;
                Ok(changed > 0)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let kind_str: String = row.get(2)?;
    let status_str: String = row.get(4)?;
    let last_heartbeat_str: Option<String> = row.get(6)?;
    let skills_str: String = row.get(7)?;
    let config_str: Option<String> = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    Ok(Agent {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: enum_from_sql(&kind_str),
        parent_agent_id: row.get(3)?,
        status: enum_from_sql(&status_str),
        current_task_id: row.get(5)?,
        last_heartbeat: last_heartbeat_str.as_deref().map(datetime_from_sql),
        skills: serde_json::from_str(&skills_str).expect("valid json"),
        config: config_str.map(|s| serde_json::from_str(&s).expect("valid json")),
        created_at: datetime_from_sql(&created_at_str),
        updated_at: datetime_from_sql(&updated_at_str),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentTask> {
    let status_str: String = row.get(5)?;
    let priority_str: String = row.get(6)?;
    let blocked_at_str: Option<String> = row.get(8)?;
    let started_at_str: Option<String> = row.get(9)?;
    let completed_at_str: Option<String> = row.get(10)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;

    Ok(AgentTask {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        linear_issue_id: row.get(2)?,
        project_id: row.get(3)?,
        title: row.get(4)?,
        status: enum_from_sql(&status_str),
        priority: enum_from_sql(&priority_str),
        blocked_reason: row.get(7)?,
        blocked_at: blocked_at_str.as_deref().map(datetime_from_sql),
        started_at: started_at_str.as_deref().map(datetime_from_sql),
        completed_at: completed_at_str.as_deref().map(datetime_from_sql),
        created_at: datetime_from_sql(&created_at_str),
        updated_at: datetime_from_sql(&updated_at_str),
    })
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRule> {
    let trigger_str: String = row.get(1)?;
    let filter_str: String = row.get(2)?;
    let delay_ms: i64 = row.get(3)?;
    let channel_str: String = row.get(4)?;
    let enabled: i64 = row.get(5)?;

    Ok(AlertRule {
        id: row.get(0)?,
        trigger: enum_from_sql(&trigger_str),
        priority_filter: enum_from_sql(&filter_str),
        delay_ms: delay_ms as u64,
        channel: enum_from_sql(&channel_str),
        enabled: enabled != 0,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let read: i64 = row.get(6)?;
    let created_at_str: String = row.get(7)?;

    Ok(Message {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        kind: enum_from_sql(&kind_str),
        content: row.get(2)?,
        task_id: row.get(3)?,
        agent_id: row.get(4)?,
        project_id: row.get(5)?,
        read: read != 0,
        created_at: datetime_from_sql(&created_at_str),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentStatus, TaskStatus};

    #[tokio::test]
    async fn fresh_database_restores_default_rules() {
        let db = StoreDb::new_in_memory().await.unwrap();
        let rules = db.list_alert_rules().await.unwrap();
        assert_eq!(rules.len(), 8);
        assert!(rules.iter().any(|r| r.id == "completed-batch"));
    }

    #[tokio::test]
    async fn agent_round_trip_preserves_fields() {
        let db = StoreDb::new_in_memory().await.unwrap();
        let mut agent = Agent::new("a-1", "builder");
        agent.status = AgentStatus::Working;
        agent.current_task_id = Some("t-1".into());
        agent.skills = vec!["rust".into(), "sql".into()];
        agent.last_heartbeat = Some(Utc::now());
        db.upsert_agent(&agent).await.unwrap();

        let loaded = db.get_agent("a-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Working);
        assert_eq!(loaded.current_task_id.as_deref(), Some("t-1"));
        assert_eq!(loaded.skills.len(), 2);
        assert!(loaded.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn upsert_agent_is_idempotent() {
        let db = StoreDb::new_in_memory().await.unwrap();
        let agent = Agent::new("a-1", "builder");
        db.upsert_agent(&agent).await.unwrap();
        db.upsert_agent(&agent).await.unwrap();
        assert_eq!(db.list_agents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn task_round_trip_with_blocked_fields() {
        let db = StoreDb::new_in_memory().await.unwrap();
        let mut task = AgentTask::new("t-1", "a-1", "Ship it", TaskPriority::High);
        task.status = TaskStatus::Blocked;
        task.blocked_reason = Some("missing credentials".into());
        task.blocked_at = Some(Utc::now());
        db.upsert_task(&task).await.unwrap();

        let loaded = db.get_task("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Blocked);
        assert_eq!(loaded.blocked_reason.as_deref(), Some("missing credentials"));
        assert!(loaded.blocked_at.is_some());
    }

    #[tokio::test]
    async fn rules_filtered_by_trigger_and_priority() {
        let db = StoreDb::new_in_memory().await.unwrap();

        let high = db
            .alert_rules_for_trigger(AlertTrigger::Blocked, Some(TaskPriority::High))
            .await
            .unwrap();
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].id, "blocked-high");

        let completed = db
            .alert_rules_for_trigger(AlertTrigger::Completed, Some(TaskPriority::Medium))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "completed-batch");
    }

    #[tokio::test]
    async fn message_round_trip_and_read_flag() {
        let db = StoreDb::new_in_memory().await.unwrap();
        let mut message = Message::new(AlertTrigger::Blocked, "agent blocked");
        message.agent_id = Some("a-1".into());
        message.task_id = Some("t-1".into());
        db.insert_message(&message).await.unwrap();
        // re-delivery must not duplicate
        db.insert_message(&message).await.unwrap();

        let listed = db.list_messages().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].read);

        assert!(db.mark_message_read(message.id).await.unwrap());
        assert!(db.list_messages().await.unwrap()[0].read);
        assert!(!db.mark_message_read(Uuid::new_v4()).await.unwrap());
    }
}
