//! Configuration for the scheduler run loop.

use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Scheduler settings, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Sleep between scheduling passes, in milliseconds.
    pub tick_interval_ms: u64,
    /// Delay before the first retry of a failed task, in milliseconds.
    ///
    /// Each consecutive failure doubles the delay, up to
    /// [`max_retry_backoff_ms`](Self::max_retry_backoff_ms).
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay, in milliseconds.
    pub max_retry_backoff_ms: u64,
    /// Number of run records kept in memory.
    pub history_limit: usize,
    /// Wait for in-flight executions when a session stops.
    pub drain_on_shutdown: bool,
    /// Maximum time to wait for in-flight executions, in milliseconds.
    pub drain_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            retry_backoff_ms: 1000,
            max_retry_backoff_ms: 60_000,
            history_limit: 400,
            drain_on_shutdown: false,
            drain_timeout_ms: 5000,
        }
    }
}

impl SchedulerConfig {
    /// Interval between scheduling passes.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Base retry delay after a failure.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Retry delay cap.
    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    /// Maximum graceful drain wait on shutdown.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Retry delay for the given consecutive failure count.
    ///
    /// `streak` is 1 after the first failure. Doubles per failure and is
    /// clamped to the configured maximum.
    pub fn backoff_for(&self, streak: u32) -> Duration {
        let exponent = streak.saturating_sub(1).min(31);
        let millis = self
            .retry_backoff_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_retry_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Check values that would make the run loop misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Config`] when the tick interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(SchedulerError::Config(
                "tick_interval_ms must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| SchedulerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SchedulerError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    ///
    /// `TICKWORK_CONFIG_DIR` overrides the platform config directory.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        if let Some(dir) = std::env::var_os("TICKWORK_CONFIG_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        dirs::config_dir()
            .map(|d| d.join("tickwork"))
            .unwrap_or_else(|| PathBuf::from("/tmp/tickwork-config"))
            .join("config.toml")
    }
}
