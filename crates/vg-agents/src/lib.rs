//! Per-task lifecycle orchestration.
//!
//! One [`orchestrator::TaskOrchestrator`] instance owns each active agent
//! task from creation to a terminal outcome. The instance is a sequential
//! state machine: external signals (sleep, wake, unblock, cancel) arrive on
//! a control channel and are applied between iterations, and every
//! externally-visible mutation goes through the retried, idempotent
//! [`activities::Activities`] layer.

pub mod activities;
pub mod idle_watch;
pub mod monitor;
pub mod orchestrator;
pub mod state;
