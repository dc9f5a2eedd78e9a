use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_timeout_hours")]
    pub default_timeout_hours: u32,
    /// A held lock with no renewal for this long is reported as stale.
    #[serde(default = "default_staleness_minutes")]
    pub staleness_minutes: u32,
    #[serde(default)]
    pub auto_renew: bool,
    #[serde(default = "default_renew_before_minutes")]
    pub renew_before_minutes: u32,
}

fn default_lock_timeout_hours() -> u32 {
    4
}

fn default_staleness_minutes() -> u32 {
    60
}

fn default_renew_before_minutes() -> u32 {
    15
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_hours: default_lock_timeout_hours(),
            staleness_minutes: default_staleness_minutes(),
            auto_renew: false,
            renew_before_minutes: default_renew_before_minutes(),
        }
    }
}

impl LockConfig {
    pub fn default_timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.default_timeout_hours))
    }

    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.staleness_minutes))
    }

    pub fn renew_before(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.renew_before_minutes))
    }
}

// ---------------------------------------------------------------------------
// MonitorConfig / PowerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    /// Capacity of the bounded channel between OS callbacks and the monitor.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_debounce_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl MonitorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    #[serde(default = "default_hard_timeout_secs")]
    pub hard_timeout_secs: u64,
}

fn default_hard_timeout_secs() -> u64 {
    5
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            hard_timeout_secs: default_hard_timeout_secs(),
        }
    }
}

impl PowerConfig {
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_secs(self.hard_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// RetryConfig / BreakerConfig / QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cool_down_secs() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
        }
    }
}

impl BreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

fn default_drain_interval_secs() -> u64 {
    15
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

impl QueueConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// BranchConfig / EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Uncurated branch receiving draft and emergency commits.
    #[serde(default = "default_draft_branch")]
    pub draft: String,
    /// Curated branch receiving milestone commits.
    #[serde(default = "default_working_branch")]
    pub working: String,
}

fn default_draft_branch() -> String {
    "draft".to_string()
}

fn default_working_branch() -> String {
    "main".to_string()
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            draft: default_draft_branch(),
            working: default_working_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// VCS executable driven by `CliEngine` (`oxen`, `git`, ...).
    #[serde(default = "default_engine_program")]
    pub program: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default)]
    pub push_after_commit: bool,
    /// Publish lock transitions to the remote for observers that poll.
    #[serde(default)]
    pub mirror_locks: bool,
}

fn default_engine_program() -> String {
    "oxen".to_string()
}

fn default_remote() -> String {
    "origin".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            remote: default_remote(),
            push_after_commit: false,
            mirror_locks: false,
        }
    }
}

impl EngineConfig {
    /// Ignore file understood by the configured engine.
    pub fn ignore_file(&self) -> &'static str {
        if self.program.contains("oxen") {
            ".oxenignore"
        } else {
            ".gitignore"
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub branches: BranchConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load `<root>/.tandem/config.yaml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        match crate::io::read_optional(&paths::config_path(root))? {
            Some(data) if !data.trim().is_empty() => Ok(serde_yaml::from_str(&data)?),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut push = |level: WarnLevel, message: String| {
            warnings.push(ConfigWarning { level, message })
        };

        if self.monitor.debounce_secs == 0 {
            push(
                WarnLevel::Warning,
                "monitor.debounce_secs is 0: every file event becomes its own draft commit"
                    .to_string(),
            );
        }
        if self.monitor.channel_capacity == 0 {
            push(
                WarnLevel::Error,
                "monitor.channel_capacity must be at least 1".to_string(),
            );
        }
        if self.lock.default_timeout_hours == 0 {
            push(
                WarnLevel::Error,
                "lock.default_timeout_hours must be at least 1".to_string(),
            );
        }
        if self.lock.auto_renew
            && i64::from(self.lock.renew_before_minutes)
                >= i64::from(self.lock.default_timeout_hours) * 60
        {
            push(
                WarnLevel::Warning,
                format!(
                    "lock.renew_before_minutes={} is not shorter than the lock timeout; \
                     the lock will be renewed on every heartbeat",
                    self.lock.renew_before_minutes
                ),
            );
        }
        if self.retry.max_attempts == 0 {
            push(
                WarnLevel::Error,
                "retry.max_attempts must be at least 1".to_string(),
            );
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            push(
                WarnLevel::Warning,
                format!(
                    "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            );
        }
        if self.breaker.failure_threshold == 0 {
            push(
                WarnLevel::Error,
                "breaker.failure_threshold must be at least 1".to_string(),
            );
        }
        if self.power.hard_timeout_secs == 0 {
            push(
                WarnLevel::Error,
                "power.hard_timeout_secs must be at least 1".to_string(),
            );
        }
        for (key, name) in [
            ("branches.draft", &self.branches.draft),
            ("branches.working", &self.branches.working),
        ] {
            if !paths::is_valid_branch(name) {
                push(WarnLevel::Error, format!("{key} '{name}' is not a valid branch name"));
            }
        }
        if self.branches.draft == self.branches.working {
            push(
                WarnLevel::Error,
                format!(
                    "draft and working branch are both '{}': drafts would pollute curated history",
                    self.branches.draft
                ),
            );
        }
        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
