//! Event bus and wire protocol for live dashboard updates.
//!
//! The orchestration core publishes best-effort [`protocol::BusEvent`]s
//! through [`event_bus::EventBus`]; UI transports subscribe and forward.

pub mod event_bus;
pub mod protocol;

pub use event_bus::EventBus;
pub use protocol::BusEvent;
