use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use vg_core::config::AlertsConfig;
use vg_core::types::AlertChannel;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RateDigestConfig {
    /// Rolling window over all processed events.
    pub digest_window: Duration,
    /// More events than this inside the window forces in-app delivery.
    pub digest_threshold: usize,
    /// Rolling window over granted push deliveries.
    pub push_window: Duration,
    pub global_push_cap: usize,
    pub per_agent_push_cap: usize,
}

impl Default for RateDigestConfig {
    fn default() -> Self {
        Self {
            digest_window: Duration::from_secs(60),
            digest_threshold: 5,
            push_window: Duration::from_secs(3600),
            global_push_cap: 10,
            per_agent_push_cap: 3,
        }
    }
}

impl From<&AlertsConfig> for RateDigestConfig {
    fn from(cfg: &AlertsConfig) -> Self {
        Self {
            digest_window: Duration::from_secs(cfg.digest_window_secs),
            digest_threshold: cfg.digest_threshold,
            push_window: Duration::from_secs(cfg.push_window_secs),
            global_push_cap: cfg.global_push_cap,
            per_agent_push_cap: cfg.per_agent_push_cap,
        }
    }
}

// ---------------------------------------------------------------------------
// Windows (behind Mutex)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Windows {
    events: VecDeque<Instant>,
    global_pushes: VecDeque<Instant>,
    agent_pushes: HashMap<String, VecDeque<Instant>>,
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, width: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= width {
            window.pop_front();
        } else {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// RateDigestController
// ---------------------------------------------------------------------------

/// Keeps notification storms off the push channel.
///
/// One instance is shared by every orchestrator; all window state lives
/// behind a single mutex so concurrent resolutions cannot double-spend the
/// push budget.
pub struct RateDigestController {
    config: RateDigestConfig,
    windows: Mutex<Windows>,
}

impl RateDigestController {
    pub fn new(config: RateDigestConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    /// Record one processed event into the digest window. Called once per
    /// `processEvent`, independent of how many rules match.
    pub async fn record_event(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        prune(&mut windows.events, now, self.config.digest_window);
        windows.events.push_back(now);
    }

    /// Whether the digest window currently exceeds the threshold.
    pub async fn digest_active(&self) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        prune(&mut windows.events, now, self.config.digest_window);
        windows.events.len() > self.config.digest_threshold
    }

    /// Resolve the effective channel for a delivery.
    ///
    /// An `in_app` rule is returned unchanged (it was never eligible for
    /// push). Otherwise digest mode forces `in_app`; failing that, a push
    /// grant requires headroom in both the global and per-agent windows and
    /// records a timestamp in each. Exhaustion downgrades to `in_app` —
    /// the message itself is never dropped.
    pub async fn resolve_channel(&self, requested: AlertChannel, agent_id: &str) -> AlertChannel {
        if !requested.wants_push() {
            return requested;
        }

        let now = Instant::now();
        let mut guard = self.windows.lock().await;
        let windows = &mut *guard;

        prune(&mut windows.events, now, self.config.digest_window);
        if windows.events.len() > self.config.digest_threshold {
            debug!(agent_id, "digest mode active — downgrading to in_app");
            return AlertChannel::InApp;
        }

        prune(&mut windows.global_pushes, now, self.config.push_window);
        let global_ok = windows.global_pushes.len() < self.config.global_push_cap;

        let agent_window = windows.agent_pushes.entry(agent_id.to_string()).or_default();
        prune(agent_window, now, self.config.push_window);
        let agent_ok = agent_window.len() < self.config.per_agent_push_cap;

        if global_ok && agent_ok {
            agent_window.push_back(now);
            windows.global_pushes.push_back(now);
            requested
        } else {
            debug!(agent_id, global_ok, agent_ok, "push budget exhausted — downgrading to in_app");
            AlertChannel::InApp
        }
    }
}

impl Default for RateDigestController {
    fn default() -> Self {
        Self::new(RateDigestConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn controller() -> RateDigestController {
        RateDigestController::default()
    }

    #[tokio::test(start_paused = true)]
    async fn in_app_rules_pass_through_untouched() {
        let rate = controller();
        // Saturate the digest window; in_app must still pass through.
        for _ in 0..10 {
            rate.record_event().await;
        }
        assert_eq!(
            rate.resolve_channel(AlertChannel::InApp, "a-1").await,
            AlertChannel::InApp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_event_in_window_engages_digest_mode() {
        let rate = controller();
        for _ in 0..5 {
            rate.record_event().await;
        }
        assert!(!rate.digest_active().await);
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::Push
        );

        rate.record_event().await;
        assert!(rate.digest_active().await);
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::InApp
        );
        assert_eq!(
            rate.resolve_channel(AlertChannel::Both, "a-2").await,
            AlertChannel::InApp
        );
    }

    #[tokio::test(start_paused = true)]
    async fn digest_mode_expires_with_the_window() {
        let rate = controller();
        for _ in 0..6 {
            rate.record_event().await;
        }
        assert!(rate.digest_active().await);

        advance(Duration::from_secs(61)).await;
        assert!(!rate.digest_active().await);
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::Push
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_agent_cap_downgrades_fourth_push() {
        let rate = controller();
        for _ in 0..3 {
            assert_eq!(
                rate.resolve_channel(AlertChannel::Push, "a-1").await,
                AlertChannel::Push
            );
        }
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::InApp
        );
        // A different agent still has budget.
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-2").await,
            AlertChannel::Push
        );
    }

    #[tokio::test(start_paused = true)]
    async fn global_cap_downgrades_eleventh_push() {
        let rate = controller();
        // Spread over four agents so the per-agent cap never binds first.
        let agents = ["a-1", "a-2", "a-3", "a-4"];
        let mut granted = 0;
        for i in 0..12 {
            let agent = agents[i % agents.len()];
            if rate.resolve_channel(AlertChannel::Both, agent).await == AlertChannel::Both {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn push_budget_recovers_after_an_hour() {
        let rate = controller();
        for _ in 0..3 {
            rate.resolve_channel(AlertChannel::Push, "a-1").await;
        }
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::InApp
        );

        advance(Duration::from_secs(3601)).await;
        assert_eq!(
            rate.resolve_channel(AlertChannel::Push, "a-1").await,
            AlertChannel::Push
        );
    }
}
