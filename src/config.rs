//! Runtime configuration
//!
//! Constants for defaults plus a TOML-loadable `Config` with one section
//! per component. Every field has a serde default so a partial
//! `.ntm/config.toml` works.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};

/// Lines captured from a pane per surveillance sweep
pub const DEFAULT_CAPTURE_LINES: usize = 50;

/// Error alerts only consider this many trailing lines
pub const ERROR_WINDOW_LINES: usize = 20;

/// Gap between staggered sends across panes (ms)
pub const DEFAULT_STAGGER_DELAY_MS: u64 = 300;

/// Delay before the submitting Enter (ms)
pub const DEFAULT_ENTER_DELAY_MS: u64 = 100;

/// Delay before the second Enter for double-Enter agents (ms)
pub const DEFAULT_DOUBLE_ENTER_DELAY_MS: u64 = 500;

/// Minimum interval between automatic rotations on the same pane (s)
pub const DEFAULT_COOLDOWN_SECS: u64 = 60;

/// Quota cache entries expire after this long (s)
pub const DEFAULT_QUOTA_TTL_SECS: u64 = 300;

/// Default quota poll period (s); sub-100ms requests are clamped to this
pub const DEFAULT_QUOTA_POLL_SECS: u64 = 60;

/// Floor for quota poll periods (ms)
pub const MIN_QUOTA_POLL_MS: u64 = 100;

/// Resolved alerts older than this are pruned (minutes)
pub const DEFAULT_RESOLVED_PRUNE_MINUTES: u64 = 30;

/// Cap on captured pane output (bytes)
pub const MAX_CAPTURE_BYTES: usize = 10 * 1024 * 1024;

/// Cap on a single history log line (bytes)
pub const MAX_HISTORY_LINE_BYTES: usize = 1024 * 1024;

/// Per-invocation timeout for account backend calls (s)
pub const ACCOUNT_BACKEND_TIMEOUT_SECS: u64 = 5;

/// Latency samples retained per operation in the metrics collector
pub const MAX_LATENCY_SAMPLES: usize = 1000;

/// Top-level runtime configuration, loaded from `.ntm/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub surveillance: SurveillanceConfig,
    pub injector: InjectorConfig,
    pub rotation: RotationConfig,
    pub quota: QuotaConfig,
    pub workflow: WorkflowConfig,
}

/// Surveillance loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveillanceConfig {
    /// Whether the loop runs at all
    pub enabled: bool,
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Lines captured per pane
    pub capture_lines: usize,
    /// Minutes of unchanged output before a working agent is called idle
    pub agent_stuck_minutes: u64,
}

impl Default for SurveillanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            capture_lines: DEFAULT_CAPTURE_LINES,
            agent_stuck_minutes: 10,
        }
    }
}

/// Prompt injector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    pub stagger_delay_ms: u64,
    pub enter_delay_ms: u64,
    pub double_enter_delay_ms: u64,
    /// Take per-provider delays from the rate-limit tracker
    pub adaptive: bool,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            stagger_delay_ms: DEFAULT_STAGGER_DELAY_MS,
            enter_delay_ms: DEFAULT_ENTER_DELAY_MS,
            double_enter_delay_ms: DEFAULT_DOUBLE_ENTER_DELAY_MS,
            adaptive: false,
        }
    }
}

impl InjectorConfig {
    pub fn stagger_delay(&self) -> Duration {
        Duration::from_millis(self.stagger_delay_ms)
    }

    pub fn enter_delay(&self) -> Duration {
        Duration::from_millis(self.enter_delay_ms)
    }

    pub fn double_enter_delay(&self) -> Duration {
        Duration::from_millis(self.double_enter_delay_ms)
    }
}

/// Account rotation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub cooldown_secs: u64,
    /// Account manager binary name
    pub backend_binary: String,
    /// Persist rotation history under the data dir
    pub persist_history: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            backend_binary: "caam".to_string(),
            persist_history: true,
        }
    }
}

/// Quota tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub ttl_secs: u64,
    pub poll_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_QUOTA_TTL_SECS,
            poll_secs: DEFAULT_QUOTA_POLL_SECS,
        }
    }
}

/// Workflow executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Default per-step timeout (s)
    pub step_timeout_secs: u64,
    /// Seconds between step-completion polls of the surveillance state
    pub poll_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 600,
            poll_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration from `<project>/.ntm/config.toml`
    ///
    /// A missing file yields defaults; a malformed file is a `CONFIG_ERROR`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(".ntm").join("config.toml");
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| NtmError::ConfigError(format!("{}: {e}", path.display())))
    }
}
