use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Result, StateStore};
use crate::types::{Agent, AgentTask, AlertRule, Message};

#[derive(Default)]
struct Inner {
    agents: HashMap<String, Agent>,
    tasks: HashMap<String, AgentTask>,
    rules: HashMap<String, AlertRule>,
    messages: Vec<Message>,
}

/// In-memory [`StateStore`] used by tests and in-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with rules, typically the default set.
    pub async fn with_rules(rules: Vec<AlertRule>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.lock().await;
            for rule in rules {
                inner.rules.insert(rule.id.clone(), rule);
            }
        }
        store
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.inner.lock().await.agents.get(id).cloned())
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.inner
            .lock()
            .await
            .agents
            .insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.inner.lock().await.agents.values().cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<Option<AgentTask>> {
        Ok(self.inner.lock().await.tasks.get(id).cloned())
    }

    async fn upsert_task(&self, task: &AgentTask) -> Result<()> {
        self.inner
            .lock()
            .await
            .tasks
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_alert_rule(&self, id: &str) -> Result<Option<AlertRule>> {
        Ok(self.inner.lock().await.rules.get(id).cloned())
    }

    async fn upsert_alert_rule(&self, rule: &AlertRule) -> Result<()> {
        self.inner
            .lock()
            .await
            .rules
            .insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn list_alert_rules(&self) -> Result<Vec<AlertRule>> {
        Ok(self.inner.lock().await.rules.values().cloned().collect())
    }

    async fn insert_message(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().await;
        // Re-delivery after a partial failure must not duplicate the record.
        if let Some(existing) = inner.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message.clone();
        } else {
            inner.messages.push(message.clone());
        }
        Ok(())
    }

    async fn list_messages(&self) -> Result<Vec<Message>> {
        Ok(self.inner.lock().await.messages.clone())
    }

    async fn mark_message_read(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertChannel, AlertTrigger, PriorityFilter, TaskPriority};

    fn rule(id: &str, trigger: AlertTrigger, filter: PriorityFilter) -> AlertRule {
        AlertRule {
            id: id.into(),
            trigger,
            priority_filter: filter,
            delay_ms: 0,
            channel: AlertChannel::InApp,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn agent_round_trip() {
        let store = MemoryStore::new();
        let agent = Agent::new("a-1", "builder");
        store.upsert_agent(&agent).await.unwrap();

        let loaded = store.get_agent("a-1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "builder");
        assert!(store.get_agent("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rules_filter_by_trigger_and_priority() {
        let store = MemoryStore::with_rules(vec![
            rule("blocked-high", AlertTrigger::Blocked, PriorityFilter::High),
            rule("blocked-low", AlertTrigger::Blocked, PriorityFilter::Low),
            rule("error-all", AlertTrigger::Error, PriorityFilter::All),
        ])
        .await;

        let matched = store
            .alert_rules_for_trigger(AlertTrigger::Blocked, Some(TaskPriority::High))
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "blocked-high");

        let all_blocked = store
            .alert_rules_for_trigger(AlertTrigger::Blocked, None)
            .await
            .unwrap();
        assert_eq!(all_blocked.len(), 2);
    }

    #[tokio::test]
    async fn disabled_rules_never_match() {
        let mut r = rule("error-all", AlertTrigger::Error, PriorityFilter::All);
        r.enabled = false;
        let store = MemoryStore::with_rules(vec![r]).await;

        let matched = store
            .alert_rules_for_trigger(AlertTrigger::Error, Some(TaskPriority::High))
            .await
            .unwrap();
        assert!(matched.is_empty());
    }

    #[tokio::test]
    async fn message_insert_is_idempotent() {
        let store = MemoryStore::new();
        let message = Message::new(AlertTrigger::Completed, "done");
        store.insert_message(&message).await.unwrap();
        store.insert_message(&message).await.unwrap();
        assert_eq!(store.list_messages().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_read() {
        let store = MemoryStore::new();
        let message = Message::new(AlertTrigger::Completed, "done");
        store.insert_message(&message).await.unwrap();

        assert!(store.mark_message_read(message.id).await.unwrap());
        assert!(store.list_messages().await.unwrap()[0].read);
        assert!(!store.mark_message_read(Uuid::new_v4()).await.unwrap());
    }
}
