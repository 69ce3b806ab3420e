use vg_core::store::{Result, StateStore};
use vg_core::types::AlertRule;

/// The id of the single batching rule. Non-high completions matched by it
/// are queued for a combined digest message instead of individual timers.
pub const BATCH_RULE_ID: &str = "completed-batch";

/// Restore the default rule set when the store holds no rules at all.
///
/// Returns `true` when the defaults were written. Existing rules — even a
/// partial or edited set — are left untouched; the settings surface owns
/// them from then on.
pub async fn ensure_default_rules(store: &dyn StateStore) -> Result<bool> {
    if !store.list_alert_rules().await?.is_empty() {
        return Ok(false);
    }

    tracing::info!("no alert rules configured — seeding default set");
    for rule in AlertRule::default_set() {
        store.upsert_alert_rule(&rule).await?;
    }
    Ok(true)
}
