// Configuration file parsing for pingrig.toml
//
// The config file tunes protocol timing, reconnect policy, and
// supervision bounds. Every field has a default, so the file is
// optional; CLI flags override whatever the file provides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure for pingrig.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Protocol timing knobs
    #[serde(default)]
    pub timing: TimingConfig,

    /// Client reconnect policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Launcher supervision bounds
    #[serde(default)]
    pub supervise: SuperviseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between probes on an established connection
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// How long a client waits for a matching ACK
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// How long the server keeps a silent connection open
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Connection attempts before the client gives up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles on each failed attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperviseConfig {
    /// How long the launcher waits for the server to accept connections
    #[serde(default = "default_ready_wait_ms")]
    pub ready_wait_ms: u64,

    /// Wait after the graceful termination signal before force-killing
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Directory for per-process outcome logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_response_timeout_ms() -> u64 {
    2000
}

fn default_idle_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_ready_wait_ms() -> u64 {
    5000
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self {
            ready_wait_ms: default_ready_wait_ms(),
            grace_period_ms: default_grace_period_ms(),
            log_dir: default_log_dir(),
        }
    }
}

impl TimingConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl SuperviseConfig {
    pub fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl Config {
    /// Load configuration from a pingrig.toml file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .context(format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Find pingrig.toml by searching current directory and ancestors.
    /// Falls back to defaults when no file exists.
    pub fn find_or_default() -> Result<Self> {
        let mut current = std::env::current_dir().context("Failed to get current directory")?;

        loop {
            let config_path = current.join("pingrig.toml");
            if config_path.exists() {
                log::info!("Loaded config from: {}", config_path.display());
                return Self::from_file(&config_path);
            }

            if !current.pop() {
                return Ok(Config::default());
            }
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.timing.probe_interval_ms == 0 {
            anyhow::bail!("timing.probe_interval_ms must be positive");
        }
        if self.timing.response_timeout_ms == 0 {
            anyhow::bail!("timing.response_timeout_ms must be positive");
        }
        if self.timing.idle_timeout_ms == 0 {
            anyhow::bail!("timing.idle_timeout_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_backoff_ms == 0 {
            anyhow::bail!("retry.initial_backoff_ms must be positive");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            anyhow::bail!("retry.max_backoff_ms must be >= retry.initial_backoff_ms");
        }

        Ok(())
    }
}
