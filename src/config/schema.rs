use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ── Top-level config ──────────────────────────────────────────────

/// Top-level swarm runtime configuration, usually loaded from `swarm.toml`.
///
/// Every section and field is optional; missing values fall back to the
/// defaults documented on each field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    /// Message bus limits (`[bus]`).
    #[serde(default)]
    pub bus: BusConfig,
    /// Agent runtime behavior (`[agent]`).
    #[serde(default)]
    pub agent: AgentRuntimeConfig,
    /// Liveness watchdog (`[deadlock]`).
    #[serde(default)]
    pub deadlock: DeadlockConfig,
    /// Logging and session log sink (`[observability]`).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Failed to parse swarm config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Render the config back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize swarm config")
    }

    pub fn validate(&self) -> Result<()> {
        // Bus
        if self.bus.history_limit == 0 {
            anyhow::bail!("bus.history_limit must be greater than 0");
        }
        if self.bus.latency_sample_limit == 0 {
            anyhow::bail!("bus.latency_sample_limit must be greater than 0");
        }

        // Agent
        for (field, value) in [
            ("agent.heartbeat_interval_secs", self.agent.heartbeat_interval_secs),
            ("agent.receive_timeout_secs", self.agent.receive_timeout_secs),
            ("agent.liveness_window_secs", self.agent.liveness_window_secs),
            ("deadlock.timeout_secs", self.deadlock.timeout_secs),
            ("deadlock.check_interval_secs", self.deadlock.check_interval_secs),
        ] {
            require_positive_secs(field, value)?;
        }

        // Observability
        if self.observability.session_log_max_entries == 0 {
            anyhow::bail!("observability.session_log_max_entries must be greater than 0");
        }
        match self.observability.backend.trim().to_ascii_lowercase().as_str() {
            "none" | "log" | "session" => {}
            other => anyhow::bail!(
                "observability.backend '{other}' is not supported; expected none, log or session"
            ),
        }

        Ok(())
    }
}

fn require_positive_secs(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        anyhow::bail!("{field} must be a positive number of seconds (got {value})");
    }
    Ok(())
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.001))
}

// ── Bus ───────────────────────────────────────────────────────────

/// What happens when a bounded inbox is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InboxOverflowPolicy {
    /// Fail the send with `InboxFull` so backpressure is visible to the sender.
    #[default]
    Reject,
    /// Evict the oldest message of the lowest non-empty priority class.
    DropOldest,
}

/// Message bus configuration (`[bus]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BusConfig {
    /// Number of message summaries retained in history. Default: `1000`.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Latency samples retained per message type. Default: `1000`.
    #[serde(default = "default_latency_sample_limit")]
    pub latency_sample_limit: usize,
    /// Inbox capacity used when an agent registers without one (`0` = unbounded). Default: `0`.
    #[serde(default)]
    pub default_inbox_capacity: usize,
    /// Policy applied when a bounded inbox is full. Default: `"reject"`.
    #[serde(default)]
    pub overflow_policy: InboxOverflowPolicy,
}

fn default_history_limit() -> usize {
    1000
}

fn default_latency_sample_limit() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            latency_sample_limit: default_latency_sample_limit(),
            default_inbox_capacity: 0,
            overflow_policy: InboxOverflowPolicy::Reject,
        }
    }
}

// ── Agent runtime ─────────────────────────────────────────────────

/// Agent runtime configuration (`[agent]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentRuntimeConfig {
    /// Seconds between heartbeat pings to the deadlock detector. Default: `5.0`.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,
    /// Keep the receive loop running after a handler error. Default: `true`.
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Seconds a single receive waits before the agent reports `waiting`. Default: `1.0`.
    #[serde(default = "default_receive_timeout_secs")]
    pub receive_timeout_secs: f64,
    /// Maximum age of `last_activity` for `is_healthy()`. Default: `60.0`.
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: f64,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_secs() -> f64 {
    5.0
}

fn default_receive_timeout_secs() -> f64 {
    1.0
}

fn default_liveness_window_secs() -> f64 {
    60.0
}

impl AgentRuntimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        secs(self.heartbeat_interval_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        secs(self.receive_timeout_secs)
    }

    pub fn liveness_window(&self) -> Duration {
        secs(self.liveness_window_secs)
    }
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            auto_restart: true,
            receive_timeout_secs: default_receive_timeout_secs(),
            liveness_window_secs: default_liveness_window_secs(),
        }
    }
}

// ── Deadlock detector ─────────────────────────────────────────────

/// Deadlock detector configuration (`[deadlock]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeadlockConfig {
    /// Run the background monitor. Default: `true`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Idle seconds after which an agent counts as stuck. Default: `300.0`.
    #[serde(default = "default_deadlock_timeout_secs")]
    pub timeout_secs: f64,
    /// Seconds between monitor checks, capped at `timeout_secs`. Default: `30.0`.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: f64,
}

fn default_deadlock_timeout_secs() -> f64 {
    300.0
}

fn default_check_interval_secs() -> f64 {
    30.0
}

impl DeadlockConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    /// Check interval never exceeds the timeout window.
    pub fn effective_check_interval(&self) -> Duration {
        secs(self.check_interval_secs.min(self.timeout_secs))
    }
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_deadlock_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

// ── Observability ─────────────────────────────────────────────────

/// Observability configuration (`[observability]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObservabilityConfig {
    /// Event sink backend: "none" | "log" | "session". Default: `"session"`.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Default tracing filter when `RUST_LOG` is unset. Default: `"info"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Session log persistence: "none" | "rolling" | "full". Default: `"none"`.
    #[serde(default = "default_session_log_mode")]
    pub session_log_mode: String,

    /// JSONL file written when persistence is enabled.
    #[serde(default = "default_session_log_path")]
    pub session_log_path: String,

    /// Lines retained on disk when `session_log_mode = "rolling"`. Default: `200`.
    #[serde(default = "default_session_log_max_entries")]
    pub session_log_max_entries: usize,

    /// Event records retained in memory. Default: `10000`.
    #[serde(default = "default_memory_max_records")]
    pub memory_max_records: usize,
}

fn default_backend() -> String {
    "session".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_log_mode() -> String {
    "none".to_string()
}

fn default_session_log_path() -> String {
    "state/session-log.jsonl".to_string()
}

fn default_session_log_max_entries() -> usize {
    200
}

fn default_memory_max_records() -> usize {
    10_000
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            log_level: default_log_level(),
            session_log_mode: default_session_log_mode(),
            session_log_path: default_session_log_path(),
            session_log_max_entries: default_session_log_max_entries(),
            memory_max_records: default_memory_max_records(),
        }
    }
}
