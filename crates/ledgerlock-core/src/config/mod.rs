//! Configuration for the lock manager and concurrency controller

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming a TOML config file
pub const CONFIG_PATH_ENV: &str = "LEDGERLOCK_CONFIG";

/// Lock manager and concurrency controller settings
///
/// Durations are written as milliseconds in TOML, e.g.
///
/// ```toml
/// default_timeout_ms = 5000
/// max_locks_per_resource = 4
/// enable_deadlock_detection = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Default wait/hold timeout for lock requests
    #[serde(rename = "default_timeout_ms", with = "duration_ms")]
    pub default_timeout: Duration,

    /// Retries after the first attempt in `execute_with_lock`
    pub max_retries: u32,

    /// Pause between attempts
    #[serde(rename = "retry_delay_ms", with = "duration_ms")]
    pub retry_delay: Duration,

    /// How often the deadlock sweep runs
    #[serde(rename = "deadlock_detection_interval_ms", with = "duration_ms")]
    pub deadlock_detection_interval: Duration,

    /// How often the expiry sweep runs
    #[serde(rename = "lock_cleanup_interval_ms", with = "duration_ms")]
    pub lock_cleanup_interval: Duration,

    /// Cap on locks held at once on one resource
    pub max_locks_per_resource: usize,

    /// Run the background deadlock sweep
    pub enable_deadlock_detection: bool,

    /// Run the background expiry sweep
    pub enable_lock_timeout: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            deadlock_detection_interval: Duration::from_secs(5),
            lock_cleanup_interval: Duration::from_secs(10),
            max_locks_per_resource: 10,
            enable_deadlock_detection: true,
            enable_lock_timeout: true,
        }
    }
}

impl ConcurrencyConfig {
    /// Set the default timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the number of retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the delay between retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_deadlock_detection_interval(mut self, interval: Duration) -> Self {
        self.deadlock_detection_interval = interval;
        self
    }

    pub fn with_lock_cleanup_interval(mut self, interval: Duration) -> Self {
        self.lock_cleanup_interval = interval;
        self
    }

    /// Set the per-resource lock cap
    pub fn with_max_locks_per_resource(mut self, max: usize) -> Self {
        self.max_locks_per_resource = max;
        self
    }

    /// Enable or disable the deadlock sweep
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.enable_deadlock_detection = enabled;
        self
    }

    /// Enable or disable the expiry sweep
    pub fn with_lock_timeout(mut self, enabled: bool) -> Self {
        self.enable_lock_timeout = enabled;
        self
    }

    /// Parse configuration from TOML; missing keys take their defaults
    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: ConcurrencyConfig =
            toml::from_str(contents).context("Failed to parse concurrency config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load from the file named by `LEDGERLOCK_CONFIG`, or use defaults
    pub fn load_from_env() -> anyhow::Result<Self> {
        match env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Serialize configuration to TOML
    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize concurrency config")
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_locks_per_resource == 0 {
            return Err(anyhow!("max_locks_per_resource must be at least 1"));
        }
        if self.enable_deadlock_detection && self.deadlock_detection_interval.is_zero() {
            return Err(anyhow!(
                "deadlock_detection_interval_ms must be positive when deadlock detection is enabled"
            ));
        }
        if self.enable_lock_timeout && self.lock_cleanup_interval.is_zero() {
            return Err(anyhow!(
                "lock_cleanup_interval_ms must be positive when lock timeout is enabled"
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
