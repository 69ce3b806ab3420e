//! Alert scheduling, rate limiting, and notification delivery.
//!
//! Events raised by orchestrator instances flow through one shared
//! [`AlertScheduler`], which applies per-rule debounce/delay, batches
//! low-severity completions, and resolves the delivery channel through the
//! [`RateDigestController`] before handing the message to the
//! [`NotificationSink`]. All three are explicit component instances passed
//! by handle to every orchestrator, never global state.

pub mod rate;
pub mod rules;
pub mod scheduler;
pub mod sink;

pub use rate::{RateDigestConfig, RateDigestController};
pub use scheduler::AlertScheduler;
pub use sink::NotificationSink;
