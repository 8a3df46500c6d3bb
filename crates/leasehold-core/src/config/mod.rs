//! Configuration parsing and management.
//!
//! The engine is configured from a single TOML file. Every field has a
//! default, so an empty file is a valid configuration that runs memory-only
//! against whatever ledger and backend the caller wires in.
//!
//! ```toml
//! [sync]
//! poll_interval = "15s"
//! backend_timeout = "10s"
//!
//! [sync.retry]
//! max_attempts = 5
//! jitter = 0.2
//! backoff = { type = "exponential", initial_delay = "500ms", max_delay = "30s" }
//!
//! [ledger]
//! read_timeout = "10s"
//! submit_timeout = "2m"
//!
//! [backend]
//! base_url = "https://mirror.example.com/api"
//! token_env = "LEASEHOLD_BACKEND_TOKEN"
//!
//! [storage]
//! cursor_db = "/var/lib/leasehold/cursor.db"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{BackoffConfig, RetryPolicy, humantime_serde};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Synchronizer settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Ledger gateway settings.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Event listener settings.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Backend store settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Persistence settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Rejects values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("sync.poll_interval", self.sync.poll_interval)?;
        non_zero("sync.backend_timeout", self.sync.backend_timeout)?;
        if self.sync.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "sync.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        jitter_in_range("sync.retry.jitter", self.sync.retry.jitter)?;
        backoff_ordered("sync.retry.backoff", &self.sync.retry.backoff)?;

        non_zero("ledger.read_timeout", self.ledger.read_timeout)?;
        non_zero("ledger.submit_timeout", self.ledger.submit_timeout)?;

        if self.listener.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "listener.channel_capacity must be at least 1".to_string(),
            ));
        }
        if self.listener.dedupe_window == 0 {
            return Err(ConfigError::Validation(
                "listener.dedupe_window must be at least 1".to_string(),
            ));
        }
        jitter_in_range("listener.reconnect_jitter", self.listener.reconnect_jitter)?;
        backoff_ordered("listener.reconnect", &self.listener.reconnect)?;

        if let Some(url) = &self.backend.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Validation(format!(
                    "backend.base_url must be an http(s) URL: {url}"
                )));
            }
        }
        Ok(())
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Validation(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}

fn jitter_in_range(field: &str, jitter: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&jitter) {
        return Err(ConfigError::Validation(format!(
            "{field} must be within 0.0..=1.0, got {jitter}"
        )));
    }
    Ok(())
}

fn backoff_ordered(field: &str, backoff: &BackoffConfig) -> Result<(), ConfigError> {
    if backoff.initial_delay() > backoff.max_delay() {
        return Err(ConfigError::Validation(format!(
            "{field}: initial delay exceeds max delay"
        )));
    }
    Ok(())
}

/// Synchronizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Interval between poll-tick reconciliations of an observed agreement.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Timeout of a single backend call.
    #[serde(default = "default_backend_timeout", with = "humantime_serde")]
    pub backend_timeout: Duration,

    /// Retry policy for backend writes.
    #[serde(default)]
    pub retry: RetryPolicy,
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(15)
}

const fn default_backend_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            backend_timeout: default_backend_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Ledger gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Timeout of a read.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Timeout of a submission, including confirmation.
    #[serde(default = "default_submit_timeout", with = "humantime_serde")]
    pub submit_timeout: Duration,
}

const fn default_read_timeout() -> Duration {
    Duration::from_secs(10)
}

const fn default_submit_timeout() -> Duration {
    Duration::from_secs(120)
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            read_timeout: default_read_timeout(),
            submit_timeout: default_submit_timeout(),
        }
    }
}

/// Event listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Capacity of the channel feeding the synchronizer.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Event identities remembered per address for de-duplication.
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,

    /// Proportional jitter applied to reconnection delays.
    #[serde(default = "default_reconnect_jitter")]
    pub reconnect_jitter: f64,

    /// Delay between reconnection attempts.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect: BackoffConfig,
}

const fn default_channel_capacity() -> usize {
    256
}

const fn default_dedupe_window() -> usize {
    4096
}

const fn default_reconnect_backoff() -> BackoffConfig {
    BackoffConfig::Exponential {
        initial_delay: Duration::from_millis(250),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
    }
}

const fn default_reconnect_jitter() -> f64 {
    0.25
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            dedupe_window: default_dedupe_window(),
            reconnect_jitter: default_reconnect_jitter(),
            reconnect: default_reconnect_backoff(),
        }
    }
}

/// Backend store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Base URL of the backend API. Without it the engine mirrors into an
    /// in-memory store.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the session token sent as a bearer
    /// credential.
    #[serde(default)]
    pub token_env: Option<String>,
}

/// Persistence configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database for sync records and listener watermarks.
    #[serde(default)]
    pub cursor_db: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.sync.poll_interval, Duration::from_secs(15));
        assert_eq!(config.sync.retry.max_attempts, 5);
        assert_eq!(config.listener.dedupe_window, 4096);
        assert!(config.backend.base_url.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [sync]
            poll_interval = "2s"
            backend_timeout = "750ms"

            [sync.retry]
            max_attempts = 4
            jitter = 0.0
            backoff = { type = "fixed", delay = "100ms" }

            [ledger]
            read_timeout = "3s"
            submit_timeout = "1m"

            [listener]
            channel_capacity = 8
            dedupe_window = 16
            reconnect_jitter = 0.1
            reconnect = { type = "linear", initial_delay = "1s", increment = "1s", max_delay = "10s" }

            [backend]
            base_url = "https://mirror.example.com/api"
            token_env = "MIRROR_TOKEN"

            [storage]
            cursor_db = "/tmp/cursor.db"
        "#;
        let config = EngineConfig::from_toml(toml).unwrap();
        assert_eq!(config.sync.poll_interval, Duration::from_secs(2));
        assert_eq!(config.sync.backend_timeout, Duration::from_millis(750));
        assert_eq!(
            config.sync.retry,
            RetryPolicy::fixed(4, Duration::from_millis(100))
        );
        assert_eq!(config.ledger.submit_timeout, Duration::from_secs(60));
        assert_eq!(config.listener.channel_capacity, 8);
        assert_eq!(
            config.backend.token_env.as_deref(),
            Some("MIRROR_TOKEN")
        );
        assert_eq!(
            config.storage.cursor_db,
            Some(PathBuf::from("/tmp/cursor.db"))
        );
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let mut config = EngineConfig::default();
        config.sync.poll_interval = Duration::from_secs(42);
        config.backend.base_url = Some("http://localhost:8080".to_string());
        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = EngineConfig::from_toml("[sync]\npoll_every = \"1s\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[sync]\npoll_interval = \"0s\"",
            "[sync.retry]\nmax_attempts = 0",
            "[sync.retry]\njitter = 1.5",
            "[sync.retry.backoff]\ntype = \"exponential\"\ninitial_delay = \"10s\"\nmax_delay = \"1s\"",
            "[listener]\ndedupe_window = 0",
            "[listener]\nchannel_capacity = 0",
            "[backend]\nbase_url = \"ftp://example.com\"",
        ];
        for case in cases {
            let err = EngineConfig::from_toml(case).unwrap_err();
            assert!(
                matches!(err, ConfigError::Validation(_)),
                "expected validation error for {case:?}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = EngineConfig::from_file(Path::new("/nonexistent/leasehold.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
