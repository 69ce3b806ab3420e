use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use vg_core::types::{AgentStatus, AlertEvent, AlertTrigger, StartTaskInput, TaskStatus};

use crate::activities::{Activities, ActivityError};
use crate::monitor::ProbeStatus;
use crate::state::{OrchestratorState, StateError, TaskStateMachine};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// An activity exhausted its retry budget. The instance stops and the
    /// failure is reported through the join handle.
    #[error("activity failure: {0}")]
    Activity(#[from] ActivityError),

    #[error("state machine error: {0}")]
    State(#[from] StateError),

    #[error("orchestrator task panicked: {0}")]
    Join(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Signals, outcome, progress
// ---------------------------------------------------------------------------

/// External control signals. Delivery mutates orchestrator-local flags
/// only; the loop applies their effect at the next evaluation point.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Sleep,
    Wake,
    Unblock { reason: Option<String> },
    Cancel,
}

/// Terminal result of one orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Completed,
    Error { reason: String },
    Cancelled,
    /// The sleep ceiling elapsed without a wake signal.
    Idle,
}

/// Read-only snapshot exposed to callers at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub state: OrchestratorState,
    pub task_title: String,
    pub blocked_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Steady-state monitor poll interval.
    pub poll_interval: Duration,
    /// Ceiling on a sleep suspension.
    pub sleep_ceiling: Duration,
    /// Blocked-wait ceiling before the one-time stale alert.
    pub unblock_ceiling: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            sleep_ceiling: Duration::from_secs(24 * 60 * 60),
            unblock_ceiling: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl From<&vg_core::config::OrchestratorConfig> for OrchestratorConfig {
    fn from(cfg: &vg_core::config::OrchestratorConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            sleep_ceiling: cfg.sleep_ceiling(),
            unblock_ceiling: cfg.unblock_ceiling(),
        }
    }
}

// ---------------------------------------------------------------------------
// OrchestratorHandle
// ---------------------------------------------------------------------------

/// Caller-side handle to a running orchestrator instance: send signals,
/// read progress, await the outcome.
pub struct OrchestratorHandle {
    signal_tx: mpsc::UnboundedSender<Signal>,
    progress_rx: watch::Receiver<Progress>,
    join: tokio::task::JoinHandle<Result<TaskOutcome>>,
}

impl OrchestratorHandle {
    pub fn sleep(&self) -> bool {
        self.signal(Signal::Sleep)
    }

    pub fn wake(&self) -> bool {
        self.signal(Signal::Wake)
    }

    pub fn unblock(&self, reason: Option<String>) -> bool {
        self.signal(Signal::Unblock { reason })
    }

    pub fn cancel(&self) -> bool {
        self.signal(Signal::Cancel)
    }

    fn signal(&self, signal: Signal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    /// Current coarse state.
    pub fn state(&self) -> OrchestratorState {
        self.progress_rx.borrow().state
    }

    /// Full progress snapshot.
    pub fn progress(&self) -> Progress {
        self.progress_rx.borrow().clone()
    }

    /// Wait for the instance to finish and return its outcome.
    pub async fn outcome(self) -> Result<TaskOutcome> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::Join(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskOrchestrator
// ---------------------------------------------------------------------------

enum SleepEnd {
    Woke,
    Ceiling,
    Cancelled,
}

enum BlockEnd {
    Unblocked,
    Cancelled,
}

/// Owns the end-to-end lifecycle of one agent task.
///
/// The instance is logically single-threaded: signals enqueue on the
/// control channel and are drained between iterations, so there is no
/// shared mutable state to tear. Every suspension (sleep wait, unblock
/// wait, poll interval) selects on the control channel and reacts to a
/// cancel the moment it arrives.
pub struct TaskOrchestrator {
    activities: Arc<Activities>,
    config: OrchestratorConfig,
    input: StartTaskInput,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    progress_tx: watch::Sender<Progress>,
    sm: TaskStateMachine,
    sleeping: bool,
    cancelled: bool,
    channel_open: bool,
    blocked_reason: Option<String>,
}

impl TaskOrchestrator {
    /// Start a new orchestration and return the caller-side handle.
    pub fn spawn(
        activities: Arc<Activities>,
        config: OrchestratorConfig,
        input: StartTaskInput,
    ) -> OrchestratorHandle {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(Progress {
            state: OrchestratorState::Starting,
            task_title: input.title.clone(),
            blocked_reason: None,
        });

        let orchestrator = TaskOrchestrator {
            activities,
            config,
            input,
            signal_rx,
            progress_tx,
            sm: TaskStateMachine::new(),
            sleeping: false,
            cancelled: false,
            channel_open: true,
            blocked_reason: None,
        };
        let join = tokio::spawn(orchestrator.run());

        OrchestratorHandle {
            signal_tx,
            progress_rx,
            join,
        }
    }

    async fn run(mut self) -> Result<TaskOutcome> {
        let result = self.run_inner().await;
        match &result {
            Ok(outcome) => {
                info!(
                    agent_id = %self.input.agent_id,
                    task_id = %self.input.task_id,
                    ?outcome,
                    "orchestration finished"
                );
            }
            Err(e) => {
                error!(
                    agent_id = %self.input.agent_id,
                    task_id = %self.input.task_id,
                    error = %e,
                    "orchestration failed"
                );
                if !self.sm.state().is_terminal() {
                    // Best-effort: surface the failure in the progress query.
                    let _ = self.advance(OrchestratorState::Error);
                }
            }
        }
        result
    }

    async fn run_inner(&mut self) -> Result<TaskOutcome> {
        info!(
            agent_id = %self.input.agent_id,
            task_id = %self.input.task_id,
            title = %self.input.title,
            priority = %self.input.priority,
            "orchestration starting"
        );

        self.activities
            .register_agent(&self.input.register_input())
            .await?;
        self.advance(OrchestratorState::Registered)?;

        self.activities.start_task(&self.input).await?;
        self.advance(OrchestratorState::Working)?;

        loop {
            self.drain_signals();
            if self.cancelled {
                return self.finish_cancelled().await;
            }

            if self.sleeping {
                match self.suspend_sleeping().await? {
                    SleepEnd::Woke => {}
                    SleepEnd::Ceiling => return Ok(TaskOutcome::Idle),
                    SleepEnd::Cancelled => return self.finish_cancelled().await,
                }
            }

            let probe = self
                .activities
                .monitor(&self.input.agent_id, &self.input.task_id)
                .await?;

            match probe {
                ProbeStatus::Completed => {
                    self.update(AgentStatus::Idle, Some(TaskStatus::Completed), None)
                        .await?;
                    self.activities
                        .send_notification(self.alert(AlertTrigger::Completed, None))
                        .await?;
                    self.advance(OrchestratorState::Completed)?;
                    return Ok(TaskOutcome::Completed);
                }

                ProbeStatus::Blocked { reason } => {
                    self.update(
                        AgentStatus::Blocked,
                        Some(TaskStatus::Blocked),
                        Some(&reason),
                    )
                    .await?;
                    self.blocked_reason = Some(reason.clone());
                    self.advance(OrchestratorState::Blocked)?;
                    self.activities
                        .send_notification(self.alert(AlertTrigger::Blocked, Some(reason)))
                        .await?;

                    match self.suspend_blocked().await? {
                        BlockEnd::Unblocked => {
                            // A delayed "still blocked" alert must not fire
                            // after resolution.
                            self.activities
                                .cancel_alerts(&self.input.agent_id, Some(&self.input.task_id))
                                .await?;
                            self.update(
                                AgentStatus::Working,
                                Some(TaskStatus::InProgress),
                                None,
                            )
                            .await?;
                            self.blocked_reason = None;
                            self.advance(OrchestratorState::Working)?;
                        }
                        BlockEnd::Cancelled => return self.finish_cancelled().await,
                    }
                }

                ProbeStatus::Error { reason } => {
                    self.update(AgentStatus::Idle, Some(TaskStatus::Cancelled), None)
                        .await?;
                    self.activities
                        .send_notification(self.alert(AlertTrigger::Error, Some(reason.clone())))
                        .await?;
                    self.advance(OrchestratorState::Error)?;
                    warn!(
                        task_id = %self.input.task_id,
                        reason = %reason,
                        "monitor reported terminal error"
                    );
                    return Ok(TaskOutcome::Error { reason });
                }

                ProbeStatus::Working => {
                    self.poll_wait().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Suspensions
    // -----------------------------------------------------------------------

    /// Park until a wake signal or the sleep ceiling.
    async fn suspend_sleeping(&mut self) -> Result<SleepEnd> {
        self.update(AgentStatus::Sleeping, None, None).await?;
        self.advance(OrchestratorState::Sleeping)?;
        info!(agent_id = %self.input.agent_id, "agent sleeping");

        let deadline = tokio::time::Instant::now() + self.config.sleep_ceiling;
        loop {
            if !self.channel_open {
                tokio::time::sleep_until(deadline).await;
                return self.sleep_ceiling_elapsed().await;
            }
            tokio::select! {
                maybe = self.signal_rx.recv() => match maybe {
                    Some(Signal::Wake) => {
                        self.sleeping = false;
                        self.update(AgentStatus::Working, None, None).await?;
                        self.advance(OrchestratorState::Working)?;
                        info!(agent_id = %self.input.agent_id, "agent woke up");
                        return Ok(SleepEnd::Woke);
                    }
                    Some(Signal::Cancel) => {
                        self.cancelled = true;
                        return Ok(SleepEnd::Cancelled);
                    }
                    Some(Signal::Sleep) => {}
                    Some(Signal::Unblock { .. }) => {
                        debug!("unblock signal while sleeping — ignored");
                    }
                    None => {
                        self.channel_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return self.sleep_ceiling_elapsed().await;
                }
            }
        }
    }

    async fn sleep_ceiling_elapsed(&mut self) -> Result<SleepEnd> {
        // The task record deliberately stays in_progress; a later
        // orchestration may resume it.
        self.update(AgentStatus::Idle, None, None).await?;
        self.advance(OrchestratorState::Idle)?;
        warn!(
            agent_id = %self.input.agent_id,
            "sleep ceiling elapsed without wake — exiting idle"
        );
        Ok(SleepEnd::Ceiling)
    }

    /// Park until an unblock signal. The stale alert fires exactly once
    /// per block episode when the ceiling elapses; the wait itself is
    /// re-entered indefinitely.
    async fn suspend_blocked(&mut self) -> Result<BlockEnd> {
        let deadline = tokio::time::Instant::now() + self.config.unblock_ceiling;
        let mut stale_fired = false;
        loop {
            if !self.channel_open {
                if !stale_fired {
                    tokio::time::sleep_until(deadline).await;
                    stale_fired = true;
                    self.fire_stale_alert().await?;
                    continue;
                }
                warn!(
                    task_id = %self.input.task_id,
                    "control channel closed while blocked — parking instance"
                );
                std::future::pending::<()>().await;
                unreachable!();
            }
            tokio::select! {
                maybe = self.signal_rx.recv() => match maybe {
                    Some(Signal::Unblock { reason }) => {
                        info!(
                            task_id = %self.input.task_id,
                            resolution = reason.as_deref().unwrap_or("unspecified"),
                            "task unblocked"
                        );
                        return Ok(BlockEnd::Unblocked);
                    }
                    Some(Signal::Cancel) => {
                        self.cancelled = true;
                        return Ok(BlockEnd::Cancelled);
                    }
                    // Sleep/wake are recorded and applied after the block
                    // resolves.
                    Some(Signal::Sleep) => {
                        self.sleeping = true;
                    }
                    Some(Signal::Wake) => {
                        self.sleeping = false;
                    }
                    None => {
                        self.channel_open = false;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if !stale_fired => {
                    stale_fired = true;
                    self.fire_stale_alert().await?;
                }
            }
        }
    }

    async fn fire_stale_alert(&mut self) -> Result<()> {
        warn!(
            task_id = %self.input.task_id,
            "blocked past the unblock ceiling — raising stale alert"
        );
        self.activities
            .send_notification(self.alert(AlertTrigger::StaleTask, self.blocked_reason.clone()))
            .await?;
        Ok(())
    }

    /// Steady-state pause between monitor polls. Returns early when a
    /// signal arrives so the loop re-evaluates immediately.
    async fn poll_wait(&mut self) {
        if !self.channel_open {
            tokio::time::sleep(self.config.poll_interval).await;
            return;
        }
        tokio::select! {
            maybe = self.signal_rx.recv() => match maybe {
                Some(signal) => self.apply_signal(signal),
                None => self.channel_open = false,
            },
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    // -----------------------------------------------------------------------
    // Signal handling
    // -----------------------------------------------------------------------

    fn drain_signals(&mut self) {
        loop {
            match self.signal_rx.try_recv() {
                Ok(signal) => self.apply_signal(signal),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.channel_open = false;
                    break;
                }
            }
        }
    }

    fn apply_signal(&mut self, signal: Signal) {
        debug!(task_id = %self.input.task_id, ?signal, "signal received");
        match signal {
            Signal::Sleep => self.sleeping = true,
            Signal::Wake => self.sleeping = false,
            Signal::Cancel => self.cancelled = true,
            Signal::Unblock { .. } => {
                debug!("unblock signal outside a blocked wait — ignored");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn finish_cancelled(&mut self) -> Result<TaskOutcome> {
        self.update(AgentStatus::Offline, Some(TaskStatus::Cancelled), None)
            .await?;
        self.advance(OrchestratorState::Cancelled)?;
        info!(
            agent_id = %self.input.agent_id,
            task_id = %self.input.task_id,
            "orchestration cancelled"
        );
        Ok(TaskOutcome::Cancelled)
    }

    async fn update(
        &self,
        agent_status: AgentStatus,
        task_status: Option<TaskStatus>,
        blocked_reason: Option<&str>,
    ) -> Result<()> {
        self.activities
            .update_dashboard(
                &self.input.agent_id,
                agent_status,
                &self.input.task_id,
                task_status,
                blocked_reason,
            )
            .await?;
        Ok(())
    }

    fn alert(&self, trigger: AlertTrigger, reason: Option<String>) -> AlertEvent {
        AlertEvent {
            trigger,
            agent_id: self.input.agent_id.clone(),
            task_id: Some(self.input.task_id.clone()),
            title: self.input.title.clone(),
            priority: self.input.priority,
            reason,
            project_id: self.input.project_id.clone(),
        }
    }

    fn advance(&mut self, to: OrchestratorState) -> Result<()> {
        self.sm.advance(to)?;
        self.progress_tx.send_replace(Progress {
            state: to,
            task_title: self.input.title.clone(),
            blocked_reason: self.blocked_reason.clone(),
        });
        Ok(())
    }
}
