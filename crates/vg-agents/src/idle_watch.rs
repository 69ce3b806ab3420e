use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use vg_core::shutdown::ShutdownSignal;
use vg_core::types::{AgentStatus, AlertEvent, AlertTrigger, TaskPriority};

use crate::activities::Activities;

/// Result of a single idle sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleReport {
    /// Idle agents inspected during this sweep.
    pub idle_agents: usize,
    /// Agents a fresh `idle_too_long` alert was raised for.
    pub notified: Vec<String>,
    /// Timestamp of this sweep.
    pub timestamp: DateTime<Utc>,
}

/// Periodically sweeps the store for agents that have sat idle past the
/// threshold and raises one `idle_too_long` alert per idle episode.
///
/// The sweep keeps its own notified-set so a long idle spell produces a
/// single alert rather than one per sweep; the set entry clears as soon as
/// the agent leaves idle.
pub struct IdleWatch {
    activities: Arc<Activities>,
    threshold: Duration,
    notified: Mutex<HashSet<String>>,
}

impl IdleWatch {
    pub fn new(activities: Arc<Activities>, threshold: Duration) -> Self {
        Self {
            activities,
            threshold,
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Execute one sweep over all agents.
    pub async fn run_sweep(&self) -> Result<IdleReport> {
        let now = Utc::now();
        debug!("idle sweep starting");

        let agents = self.activities.store().list_agents().await?;
        let mut notified = self.notified.lock().await;
        let mut report = IdleReport {
            idle_agents: 0,
            notified: Vec::new(),
            timestamp: now,
        };

        for agent in &agents {
            if agent.status != AgentStatus::Idle {
                notified.remove(&agent.id);
                continue;
            }
            report.idle_agents += 1;

            let last_seen = agent.last_heartbeat.unwrap_or(agent.updated_at);
            let elapsed = now
                .signed_duration_since(last_seen)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed <= self.threshold || notified.contains(&agent.id) {
                continue;
            }

            info!(
                agent_id = %agent.id,
                idle_mins = elapsed.as_secs() / 60,
                "agent idle past threshold"
            );
            self.activities
                .send_notification(AlertEvent {
                    trigger: AlertTrigger::IdleTooLong,
                    agent_id: agent.id.clone(),
                    task_id: None,
                    title: agent.name.clone(),
                    priority: TaskPriority::Medium,
                    reason: None,
                    project_id: None,
                })
                .await?;
            notified.insert(agent.id.clone());
            report.notified.push(agent.id.clone());
        }

        debug!(
            idle_agents = report.idle_agents,
            notified = report.notified.len(),
            "idle sweep completed"
        );
        Ok(report)
    }

    /// Sweep on `interval` until the shutdown signal triggers.
    pub async fn run(&self, interval: Duration, shutdown: ShutdownSignal) {
        let mut rx = shutdown.subscribe();
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    info!("idle watch stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_sweep().await {
                        warn!(error = %e, "idle sweep failed");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use vg_alerts::{AlertScheduler, NotificationSink, RateDigestController};
    use vg_bridge::EventBus;
    use vg_core::retry::RetryPolicy;
    use vg_core::store::{MemoryStore, StateStore};
    use vg_core::types::{Agent, AlertRule};

    use crate::monitor::StoreMonitorProbe;

    async fn watch_with_store() -> (IdleWatch, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_rules(AlertRule::default_set()).await);
        let bus = EventBus::new();
        let sink = NotificationSink::new(store.clone(), bus.clone(), RetryPolicy::default());
        let scheduler =
            AlertScheduler::new(store.clone(), sink, Arc::new(RateDigestController::default()));
        let probe = Arc::new(StoreMonitorProbe::new(store.clone()));
        let activities = Arc::new(Activities::new(
            store.clone(),
            scheduler,
            bus,
            probe,
            RetryPolicy::default(),
        ));
        (
            IdleWatch::new(activities, Duration::from_secs(30 * 60)),
            store,
        )
    }

    fn idle_agent(id: &str, idle_for: chrono::Duration) -> Agent {
        let mut agent = Agent::new(id, format!("agent {id}"));
        agent.status = AgentStatus::Idle;
        agent.last_heartbeat = Some(Utc::now() - idle_for);
        agent
    }

    #[tokio::test]
    async fn fresh_idle_agents_are_not_reported() {
        let (watch, store) = watch_with_store().await;
        store
            .upsert_agent(&idle_agent("a-1", chrono::Duration::minutes(5)))
            .await
            .unwrap();

        let report = watch.run_sweep().await.unwrap();
        assert_eq!(report.idle_agents, 1);
        assert!(report.notified.is_empty());
    }

    #[tokio::test]
    async fn stale_idle_agent_is_notified_once_per_episode() {
        let (watch, store) = watch_with_store().await;
        store
            .upsert_agent(&idle_agent("a-1", chrono::Duration::minutes(45)))
            .await
            .unwrap();

        let report = watch.run_sweep().await.unwrap();
        assert_eq!(report.notified, vec!["a-1".to_string()]);

        // A second sweep inside the same idle episode stays quiet.
        let report = watch.run_sweep().await.unwrap();
        assert!(report.notified.is_empty());
    }

    #[tokio::test]
    async fn leaving_idle_rearms_the_alert() {
        let (watch, store) = watch_with_store().await;
        store
            .upsert_agent(&idle_agent("a-1", chrono::Duration::minutes(45)))
            .await
            .unwrap();
        assert_eq!(watch.run_sweep().await.unwrap().notified.len(), 1);

        // The agent picks up work, then goes idle-stale again.
        let mut working = store.get_agent("a-1").await.unwrap().unwrap();
        working.status = AgentStatus::Working;
        store.upsert_agent(&working).await.unwrap();
        watch.run_sweep().await.unwrap();

        store
            .upsert_agent(&idle_agent("a-1", chrono::Duration::minutes(45)))
            .await
            .unwrap();
        assert_eq!(watch.run_sweep().await.unwrap().notified.len(), 1);
    }

    #[tokio::test]
    async fn working_agents_are_ignored() {
        let (watch, store) = watch_with_store().await;
        let mut agent = idle_agent("a-1", chrono::Duration::hours(3));
        agent.status = AgentStatus::Working;
        agent.current_task_id = Some("t-1".into());
        store.upsert_agent(&agent).await.unwrap();

        let report = watch.run_sweep().await.unwrap();
        assert_eq!(report.idle_agents, 0);
        assert!(report.notified.is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let (watch, _store) = watch_with_store().await;
        let shutdown = ShutdownSignal::new();
        let shutdown_clone = shutdown.clone();

        let handle = tokio::spawn(async move {
            watch.run(Duration::from_secs(3600), shutdown_clone).await;
        });

        // Let the spawned loop subscribe before the signal fires, otherwise
        // the broadcast send lands with no receivers and is dropped.
        tokio::task::yield_now().await;
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("idle watch should stop on shutdown")
            .unwrap();
    }
}
