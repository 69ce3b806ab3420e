use std::sync::Arc;

use tracing::{debug, warn};

use vg_bridge::protocol::{self, NotificationPayload};
use vg_bridge::{BusEvent, EventBus};
use vg_core::retry::{retry, RetryError, RetryPolicy};
use vg_core::store::StateStore;
use vg_core::types::{AlertChannel, AlertEvent, Message};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to persist message: {0}")]
    Persist(#[from] RetryError),
}

pub type Result<T> = std::result::Result<T, SinkError>;

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

/// Persists a notification message, then publishes the matching bus event.
///
/// The write comes first and is the only fallible step: a bus problem must
/// never lose the persisted record, so publishing is strictly best-effort.
#[derive(Clone)]
pub struct NotificationSink {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    retry: RetryPolicy,
}

impl NotificationSink {
    pub fn new(store: Arc<dyn StateStore>, bus: EventBus, retry: RetryPolicy) -> Self {
        Self { store, bus, retry }
    }

    /// Write `message` and broadcast a `notification` bus event carrying
    /// the resolved channel (and, for non-batch deliveries, the original
    /// alert).
    pub async fn deliver(
        &self,
        message: &Message,
        channel: AlertChannel,
        batch: bool,
        alert: Option<&AlertEvent>,
    ) -> Result<()> {
        retry(&self.retry, "insert_message", || {
            self.store.insert_message(message)
        })
        .await?;

        debug!(
            message_id = %message.id,
            kind = %message.kind,
            ?channel,
            batch,
            "notification persisted"
        );

        let payload = NotificationPayload {
            message_id: message.id,
            kind: message.kind,
            content: message.content.clone(),
            channel,
            batch,
            alert: alert.cloned(),
        };
        match serde_json::to_value(&payload) {
            Ok(value) => self
                .bus
                .publish(BusEvent::new(protocol::NOTIFICATION, value)),
            Err(e) => {
                // The message is already durable; only the live update is lost.
                warn!(message_id = %message.id, error = %e, "failed to encode bus payload");
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
