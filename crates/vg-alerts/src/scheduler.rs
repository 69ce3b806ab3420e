use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vg_core::store::{StateStore, StoreError};
use vg_core::types::{AlertEvent, AlertRule, AlertTrigger, Message, TaskPriority};

use crate::rate::RateDigestController;
use crate::rules::BATCH_RULE_ID;
use crate::sink::{NotificationSink, SinkError};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("delivery error: {0}")]
    Delivery(#[from] SinkError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

// ---------------------------------------------------------------------------
// Pending timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    rule_id: String,
    agent_id: String,
    task_id: Option<String>,
}

struct PendingAlert {
    /// Identifies the live timer for this key. A timer that wakes up and
    /// finds a different generation lost a debounce race and must not fire.
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BatchState {
    queue: Vec<AlertEvent>,
    timer_armed: bool,
}

// ---------------------------------------------------------------------------
// AlertScheduler
// ---------------------------------------------------------------------------

/// Decides when, and whether, a triggered event becomes a persisted
/// notification.
///
/// One scheduler instance is shared by every orchestrator. The pending map
/// and batch queue are mutated concurrently from many instances, so both
/// live behind mutexes, and the debounce replace (abort-old, insert-new) is
/// atomic with respect to a concurrent fire of the old timer: the timer
/// re-checks its generation under the map lock before delivering.
#[derive(Clone)]
pub struct AlertScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<dyn StateStore>,
    sink: NotificationSink,
    rate: Arc<RateDigestController>,
    pending: Mutex<HashMap<PendingKey, PendingAlert>>,
    batch: Mutex<BatchState>,
    generation: AtomicU64,
}

impl AlertScheduler {
    pub fn new(
        store: Arc<dyn StateStore>,
        sink: NotificationSink,
        rate: Arc<RateDigestController>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                sink,
                rate,
                pending: Mutex::new(HashMap::new()),
                batch: Mutex::new(BatchState::default()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Route one triggered event through every matching enabled rule.
    pub async fn process_event(&self, event: AlertEvent) -> Result<()> {
        self.inner.rate.record_event().await;

        let rules = self
            .inner
            .store
            .alert_rules_for_trigger(event.trigger, Some(event.priority))
            .await?;

        if rules.is_empty() {
            debug!(trigger = %event.trigger, priority = %event.priority, "no matching alert rules");
            return Ok(());
        }

        for rule in rules {
            if rule.id == BATCH_RULE_ID && event.priority != TaskPriority::High {
                self.enqueue_batch(&rule, event.clone()).await;
            } else {
                self.schedule(rule, event.clone()).await?;
            }
        }
        Ok(())
    }

    /// Add a low-severity completion to the shared batch queue, arming the
    /// flush timer when it is not already running.
    async fn enqueue_batch(&self, rule: &AlertRule, event: AlertEvent) {
        let mut batch = self.inner.batch.lock().await;
        batch.queue.push(event);
        debug!(queued = batch.queue.len(), "completion added to batch queue");

        if !batch.timer_armed {
            batch.timer_armed = true;
            let inner = Arc::clone(&self.inner);
            let rule = rule.clone();
            tokio::spawn(async move {
                tokio::time::sleep(rule.delay()).await;
                inner.flush_batch(&rule).await;
            });
        }
    }

    /// Debounce-replace, then fire immediately or start a delay timer.
    async fn schedule(&self, rule: AlertRule, event: AlertEvent) -> Result<()> {
        let key = PendingKey {
            rule_id: rule.id.clone(),
            agent_id: event.agent_id.clone(),
            task_id: event.task_id.clone(),
        };

        if rule.delay_ms == 0 {
            // A fresh event supersedes any pending timer for the same key.
            if let Some(prev) = self.inner.pending.lock().await.remove(&key) {
                prev.handle.abort();
            }
            return self.inner.fire(&rule, &event).await;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.inner.pending.lock().await;

        // Spawn while holding the lock: the timer cannot observe the map
        // until its own entry is in place.
        let inner = Arc::clone(&self.inner);
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(rule.delay()).await;
            let live = {
                let mut pending = inner.pending.lock().await;
                match pending.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&timer_key);
                        true
                    }
                    _ => false,
                }
            };
            if !live {
                return;
            }
            if let Err(e) = inner.fire(&rule, &event).await {
                warn!(rule_id = %rule.id, error = %e, "delayed alert delivery failed");
            }
        });

        if let Some(prev) = pending.insert(key, PendingAlert { generation, handle }) {
            prev.handle.abort();
        }
        Ok(())
    }

    /// Cancel every pending timer for `agent_id` (and `task_id`, if given).
    /// Returns the number of timers cancelled. Queued batch completions are
    /// left alone — they record finished work, not stale warnings.
    pub async fn cancel_pending(&self, agent_id: &str, task_id: Option<&str>) -> usize {
        let mut pending = self.inner.pending.lock().await;
        let keys: Vec<PendingKey> = pending
            .keys()
            .filter(|k| {
                k.agent_id == agent_id
                    && task_id.map_or(true, |t| k.task_id.as_deref() == Some(t))
            })
            .cloned()
            .collect();

        for key in &keys {
            if let Some(entry) = pending.remove(key) {
                entry.handle.abort();
            }
        }

        if !keys.is_empty() {
            info!(agent_id, ?task_id, cancelled = keys.len(), "pending alerts cancelled");
        }
        keys.len()
    }

    /// Number of live pending timers.
    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }
}

impl SchedulerInner {
    /// Drain the batch queue into a single combined message.
    async fn flush_batch(&self, rule: &AlertRule) {
        let events = {
            let mut batch = self.batch.lock().await;
            batch.timer_armed = false;
            std::mem::take(&mut batch.queue)
        };
        if events.is_empty() {
            return;
        }

        let mut message = if events.len() == 1 {
            let event = &events[0];
            let mut m = Message::new(
                AlertTrigger::Completed,
                format!("Task completed: {}", event.title),
            );
            m.task_id = event.task_id.clone();
            m.agent_id = Some(event.agent_id.clone());
            m.project_id = event.project_id.clone();
            m
        } else {
            let titles: Vec<&str> = events.iter().map(|e| e.title.as_str()).collect();
            Message::new(
                AlertTrigger::Completed,
                format!(
                    "{} tasks completed in the last {} minutes: {}",
                    events.len(),
                    rule.delay_ms / 60_000,
                    titles.join(", ")
                ),
            )
        };
        message.project_id = message
            .project_id
            .take()
            .or_else(|| events.iter().find_map(|e| e.project_id.clone()));

        info!(count = events.len(), "flushing completion batch");
        if let Err(e) = self.sink.deliver(&message, rule.channel, true, None).await {
            warn!(error = %e, "batch flush delivery failed");
        }
    }

    /// Deliver one alert now: render content, resolve the channel, persist
    /// and publish.
    async fn fire(&self, rule: &AlertRule, event: &AlertEvent) -> Result<()> {
        let channel = self
            .rate
            .resolve_channel(rule.channel, &event.agent_id)
            .await;

        let mut message = Message::new(event.trigger, render_content(event));
        message.task_id = event.task_id.clone();
        message.agent_id = Some(event.agent_id.clone());
        message.project_id = event.project_id.clone();

        debug!(
            rule_id = %rule.id,
            trigger = %event.trigger,
            agent_id = %event.agent_id,
            ?channel,
            "firing alert"
        );
        self.sink.deliver(&message, channel, false, Some(event)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Content templates
// ---------------------------------------------------------------------------

fn render_content(event: &AlertEvent) -> String {
    let reason = event.reason.as_deref().unwrap_or("unknown");
    match event.trigger {
        AlertTrigger::Blocked => format!(
            "[{}] Agent {} is blocked on '{}': {}",
            event.priority, event.agent_id, event.title, reason
        ),
        AlertTrigger::Completed => {
            format!("Agent {} completed '{}'", event.agent_id, event.title)
        }
        AlertTrigger::Error => format!(
            "Agent {} failed '{}': {}",
            event.agent_id, event.title, reason
        ),
        AlertTrigger::StaleTask => format!(
            "Task '{}' has been blocked for >2h (agent {})",
            event.title, event.agent_id
        ),
        AlertTrigger::IdleTooLong => {
            format!("Agent {} has been idle for >30min", event.agent_id)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::advance;
    use vg_bridge::EventBus;
    use vg_core::retry::RetryPolicy;
    use vg_core::store::MemoryStore;
    use vg_core::types::AlertRule as Rule;

    async fn scheduler() -> (AlertScheduler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_rules(Rule::default_set()).await);
        let sink = NotificationSink::new(store.clone(), EventBus::new(), RetryPolicy::default());
        let rate = Arc::new(RateDigestController::default());
        (AlertScheduler::new(store.clone(), sink, rate), store)
    }

    fn blocked_event(agent: &str, task: &str, priority: TaskPriority, reason: &str) -> AlertEvent {
        AlertEvent {
            trigger: AlertTrigger::Blocked,
            agent_id: agent.into(),
            task_id: Some(task.into()),
            title: format!("Task {task}"),
            priority,
            reason: Some(reason.into()),
            project_id: None,
        }
    }

    fn completed_event(agent: &str, task: &str, priority: TaskPriority) -> AlertEvent {
        AlertEvent {
            trigger: AlertTrigger::Completed,
            agent_id: agent.into(),
            task_id: Some(task.into()),
            title: format!("Task {task}"),
            priority,
            reason: None,
            project_id: None,
        }
    }

    // Let spawned timer tasks run up to the lock/fire point.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_rule_fires_immediately() {
        let (scheduler, store) = scheduler().await;

        scheduler
            .process_event(blocked_event("a-1", "t-1", TaskPriority::High, "no creds"))
            .await
            .unwrap();

        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("no creds"));
        assert!(messages[0].content.contains("a-1"));
        assert!(messages[0].content.contains("high"));
        assert_eq!(scheduler.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_rule_schedules_one_timer() {
        let (scheduler, store) = scheduler().await;

        scheduler
            .process_event(blocked_event("a-1", "t-1", TaskPriority::Medium, "waiting"))
            .await
            .unwrap();

        assert_eq!(scheduler.pending_count().await, 1);
        assert!(store.list_messages().await.unwrap().is_empty());

        // blocked-medium delay is 10 minutes
        settle().await;
        advance(Duration::from_secs(601)).await;
        settle().await;

        assert_eq!(scheduler.pending_count().await, 0);
        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("waiting"));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_replace_keeps_only_latest_event() {
        let (scheduler, store) = scheduler().await;

        for reason in ["first", "second", "third"] {
            scheduler
                .process_event(blocked_event("a-1", "t-1", TaskPriority::Medium, reason))
                .await
                .unwrap();
        }
        assert_eq!(scheduler.pending_count().await, 1);

        settle().await;
        advance(Duration::from_secs(601)).await;
        settle().await;

        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1, "only the last debounced event fires");
        assert!(messages[0].content.contains("third"));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_restarts_the_delay() {
        let (scheduler, store) = scheduler().await;

        scheduler
            .process_event(blocked_event("a-1", "t-1", TaskPriority::Medium, "first"))
            .await
            .unwrap();

        settle().await;
        advance(Duration::from_secs(500)).await;
        scheduler
            .process_event(blocked_event("a-1", "t-1", TaskPriority::Medium, "second"))
            .await
            .unwrap();

        // The original deadline passes without a fire.
        settle().await;
        advance(Duration::from_secs(150)).await;
        settle().await;
        assert!(store.list_messages().await.unwrap().is_empty());

        settle().await;
        advance(Duration::from_secs(500)).await;
        settle().await;
        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_removes_exactly_the_matching_timers() {
        let (scheduler, store) = scheduler().await;

        scheduler
            .process_event(blocked_event("a-1", "t-1", TaskPriority::Medium, "r1"))
            .await
            .unwrap();
        scheduler
            .process_event(blocked_event("a-1", "t-2", TaskPriority::Low, "r2"))
            .await
            .unwrap();
        scheduler
            .process_event(blocked_event("a-2", "t-3", TaskPriority::Medium, "r3"))
            .await
            .unwrap();
        assert_eq!(scheduler.pending_count().await, 3);

        // Task-scoped cancel removes only that pair.
        assert_eq!(scheduler.cancel_pending("a-1", Some("t-1")).await, 1);
        assert_eq!(scheduler.pending_count().await, 2);

        // Agent-scoped cancel removes the rest of a-1.
        assert_eq!(scheduler.cancel_pending("a-1", None).await, 1);
        assert_eq!(scheduler.pending_count().await, 1);

        // Cancelled timers never fire.
        settle().await;
        advance(Duration::from_secs(3601)).await;
        settle().await;
        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("r3"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_pending_on_unknown_agent_returns_zero() {
        let (scheduler, _store) = scheduler().await;
        assert_eq!(scheduler.cancel_pending("ghost", None).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_collects_non_high_completions_into_one_message() {
        let (scheduler, store) = scheduler().await;

        for task in ["t-1", "t-2", "t-3"] {
            scheduler
                .process_event(completed_event("a-1", task, TaskPriority::Medium))
                .await
                .unwrap();
        }
        // No standalone timers; the queue holds all three.
        assert_eq!(scheduler.pending_count().await, 0);
        assert!(store.list_messages().await.unwrap().is_empty());

        // completed-batch delay is 15 minutes
        settle().await;
        advance(Duration::from_secs(901)).await;
        settle().await;

        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        let content = &messages[0].content;
        assert!(content.contains("3 tasks completed in the last 15 minutes"));
        assert!(content.contains("Task t-1"));
        assert!(content.contains("Task t-2"));
        assert!(content.contains("Task t-3"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_queued_completion_flushes_with_singular_wording() {
        let (scheduler, store) = scheduler().await;

        scheduler
            .process_event(completed_event("a-1", "t-1", TaskPriority::Low))
            .await
            .unwrap();

        settle().await;
        advance(Duration::from_secs(901)).await;
        settle().await;

        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.starts_with("Task completed:"));
        assert_eq!(messages[0].agent_id.as_deref(), Some("a-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_completion_bypasses_the_batch() {
        let (scheduler, store) = scheduler().await;

        for task in ["t-1", "t-2", "t-3"] {
            scheduler
                .process_event(completed_event("a-1", task, TaskPriority::Medium))
                .await
                .unwrap();
        }
        scheduler
            .process_event(completed_event("a-2", "t-9", TaskPriority::High))
            .await
            .unwrap();

        // completed-high fires immediately, before any batch flush.
        let messages = store.list_messages().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("Agent a-2 completed 'Task t-9'"));

        settle().await;
        advance(Duration::from_secs(901)).await;
        settle().await;

        // Exactly one combined message carries the three medium titles.
        let messages = store.list_messages().await.unwrap();
        let batch: Vec<_> = messages
            .iter()
            .filter(|m| m.content.contains("tasks completed in the last"))
            .collect();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].content.contains("Task t-1"));
        assert!(batch[0].content.contains("Task t-2"));
        assert!(batch[0].content.contains("Task t-3"));
        assert!(!batch[0].content.contains("Task t-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_rules_produce_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut rule = Rule::default_set()
            .into_iter()
            .find(|r| r.id == "error-all")
            .unwrap();
        rule.enabled = false;
        store.upsert_alert_rule(&rule).await.unwrap();

        let sink = NotificationSink::new(store.clone(), EventBus::new(), RetryPolicy::default());
        let scheduler =
            AlertScheduler::new(store.clone(), sink, Arc::new(RateDigestController::default()));

        scheduler
            .process_event(AlertEvent {
                trigger: AlertTrigger::Error,
                agent_id: "a-1".into(),
                task_id: Some("t-1".into()),
                title: "Task t-1".into(),
                priority: TaskPriority::High,
                reason: Some("boom".into()),
                project_id: None,
            })
            .await
            .unwrap();

        assert!(store.list_messages().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_template_includes_marker() {
        let event = AlertEvent {
            trigger: AlertTrigger::StaleTask,
            agent_id: "a-1".into(),
            task_id: Some("t-1".into()),
            title: "Migrate schema".into(),
            priority: TaskPriority::High,
            reason: None,
            project_id: None,
        };
        let content = render_content(&event);
        assert!(content.contains(">2h"));
        assert!(content.contains("Migrate schema"));
        assert!(content.contains("a-1"));

        let idle = AlertEvent {
            trigger: AlertTrigger::IdleTooLong,
            agent_id: "a-2".into(),
            task_id: None,
            title: "scout".into(),
            priority: TaskPriority::Medium,
            reason: None,
            project_id: None,
        };
        assert!(render_content(&idle).contains(">30min"));
    }
}
