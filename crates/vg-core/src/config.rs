use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level runtime configuration, loaded from a TOML file.
///
/// Every section falls back to the built-in defaults when absent, so an
/// empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub idle: IdleConfig,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.poll_interval_secs must be > 0".into(),
            ));
        }
        if self.orchestrator.sleep_ceiling_secs == 0 || self.orchestrator.unblock_ceiling_secs == 0
        {
            return Err(ConfigError::Invalid(
                "orchestrator ceilings must be > 0".into(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::Invalid("retry.attempts must be > 0".into()));
        }
        if self.alerts.global_push_cap == 0 || self.alerts.per_agent_push_cap == 0 {
            return Err(ConfigError::Invalid("alert push caps must be > 0".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Steady-state monitor poll interval.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Ceiling on a sleep suspension before the instance exits idle.
    #[serde(default = "default_sleep_ceiling_secs")]
    pub sleep_ceiling_secs: u64,
    /// How long a task may stay blocked before the stale alert fires.
    #[serde(default = "default_unblock_ceiling_secs")]
    pub unblock_ceiling_secs: u64,
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sleep_ceiling(&self) -> Duration {
        Duration::from_secs(self.sleep_ceiling_secs)
    }

    pub fn unblock_ceiling(&self) -> Duration {
        Duration::from_secs(self.unblock_ceiling_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            sleep_ceiling_secs: default_sleep_ceiling_secs(),
            unblock_ceiling_secs: default_unblock_ceiling_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_digest_window_secs")]
    pub digest_window_secs: u64,
    /// Digest mode engages when more events than this land in the window.
    #[serde(default = "default_digest_threshold")]
    pub digest_threshold: usize,
    #[serde(default = "default_push_window_secs")]
    pub push_window_secs: u64,
    #[serde(default = "default_global_push_cap")]
    pub global_push_cap: usize,
    #[serde(default = "default_per_agent_push_cap")]
    pub per_agent_push_cap: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            digest_window_secs: default_digest_window_secs(),
            digest_threshold: default_digest_threshold(),
            push_window_secs: default_push_window_secs(),
            global_push_cap: default_global_push_cap(),
            per_agent_push_cap: default_per_agent_push_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Idle agents older than this produce an `idle_too_long` alert.
    #[serde(default = "default_idle_threshold_secs")]
    pub threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl IdleConfig {
    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            threshold_secs: default_idle_threshold_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_sleep_ceiling_secs() -> u64 {
    24 * 60 * 60
}

fn default_unblock_ceiling_secs() -> u64 {
    2 * 60 * 60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    600
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_digest_window_secs() -> u64 {
    60
}

fn default_digest_threshold() -> usize {
    5
}

fn default_push_window_secs() -> u64 {
    3600
}

fn default_global_push_cap() -> usize {
    10
}

fn default_per_agent_push_cap() -> usize {
    3
}

fn default_idle_threshold_secs() -> u64 {
    30 * 60
}

fn default_sweep_interval_secs() -> u64 {
    5 * 60
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
