//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Configuration for the reconciliation worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the TOML inventory seeding the in-memory store
    pub inventory_path: PathBuf,

    /// Redis URL for the shared lock store and node update channel.
    /// Without it, locks and events are process-local.
    pub redis_url: Option<String>,

    /// Name of the environment variable holding the credential master key
    pub master_key_env: String,

    /// Interval between full sweeps of every enabled node
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// A deployment whose last check is older than this is re-checked
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    /// Timeout for establishing an SSH session
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout for a single remote command or file operation
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Delay before resubscribing after the node update channel closes
    #[serde(with = "duration_secs")]
    pub resubscribe_delay: Duration,

    /// Command used to run docker compose on nodes
    pub compose_command: String,

    /// Per-node lock timings
    pub lock: LockConfig,

    /// Backoff between reconnect attempts to an unreachable node
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inventory_path: super::default_config_dir().join("inventory.toml"),
            redis_url: None,
            master_key_env: "SUPERCOMPOSE_CRYPTO_KEY".to_string(),
            sweep_interval: Duration::from_secs(60 * 60),
            check_interval: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(5),
            compose_command: "/usr/bin/docker compose".to_string(),
            lock: LockConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be positive".into()));
        }
        if self.compose_command.trim().is_empty() {
            return Err(ConfigError::MissingField("compose_command".into()));
        }
        if self.master_key_env.trim().is_empty() {
            return Err(ConfigError::MissingField("master_key_env".into()));
        }
        self.lock.validate()?;
        self.backoff.validate()
    }
}

/// Timings for the per-node reconciliation lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a lock survives without renewal
    #[serde(with = "duration_millis")]
    pub lease: Duration,

    /// Pause between acquisition attempts
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,

    /// Give up acquiring after this long
    #[serde(with = "duration_millis")]
    pub retry_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(10),
            retry_interval: Duration::from_millis(100),
            retry_timeout: Duration::from_millis(500),
        }
    }
}

impl LockConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease < Duration::from_millis(30) {
            return Err(ConfigError::Invalid("lock.lease must be at least 30ms".into()));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Invalid("lock.retry_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(15 * 60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid("backoff.multiplier must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("backoff.jitter must be within 0.0..=1.0".into()));
        }
        if self.initial > self.max {
            return Err(ConfigError::Invalid("backoff.initial exceeds backoff.max".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.lock.lease, Duration::from_secs(10));
        assert_eq!(config.lock.retry_timeout, Duration::from_millis(500));
        assert_eq!(config.lock.retry_interval, Duration::from_millis(100));
        assert_eq!(config.sweep_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: WorkerConfig = toml::from_str(
            r#"
            redis_url = "redis://cache:6379"
            sweep_interval = 600

            [lock]
            lease = 20000
            "#,
        )
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.sweep_interval, Duration::from_secs(600));
        assert_eq!(config.lock.lease, Duration::from_secs(20));
        assert_eq!(config.lock.retry_interval, Duration::from_millis(100));
        assert_eq!(config.compose_command, "/usr/bin/docker compose");
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        let mut config = WorkerConfig::default();
        config.backoff.jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_compose_command() {
        let mut config = WorkerConfig::default();
        config.compose_command = "  ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }
}
