//! Configuration for the key-value coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default interval between heartbeat pings.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of consecutive failed pings before the connection is reset.
pub const DEFAULT_MAX_HEARTBEAT_FAILURES: u32 = 5;

/// Default time a caller waits for the coordinator to hand out a client.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time [`KvService::shutdown`](crate::KvService::shutdown) waits for the coordinator.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalid configuration value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid configuration for {field}: {reason}")]
pub struct ConfigError {
    /// The offending field.
    pub field: &'static str,
    /// Why the value was rejected.
    pub reason: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self { field, reason: reason.into() }
    }
}

/// Configuration for [`KvService`](crate::KvService).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use warden_kvstore::KvServiceConfig;
///
/// let config = KvServiceConfig::builder()
///     .heartbeat_interval(Duration::from_secs(2))
///     .max_heartbeat_failures(3)
///     .build()?;
/// assert_eq!(config.max_heartbeat_failures(), 3);
/// # Ok::<(), warden_kvstore::ConfigError>(())
/// ```
///
/// Deserializing uses human-readable durations:
///
/// ```
/// use warden_kvstore::KvServiceConfig;
///
/// let config: KvServiceConfig =
///     serde_json::from_str(r#"{"heartbeat_interval": "10s", "max_heartbeat_failures": 2}"#)?;
/// assert_eq!(config.heartbeat_interval().as_secs(), 10);
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KvServiceConfig {
    /// Interval between heartbeat pings.
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    heartbeat_interval: Duration,

    /// Consecutive failed pings tolerated before the connection is reset.
    #[serde(default = "default_max_heartbeat_failures")]
    max_heartbeat_failures: u32,

    /// How long a caller waits for the coordinator to answer.
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    request_timeout: Duration,

    /// How long shutdown waits for the coordinator to exit.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    shutdown_timeout: Duration,
}

fn default_heartbeat_interval() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_max_heartbeat_failures() -> u32 {
    DEFAULT_MAX_HEARTBEAT_FAILURES
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

#[bon::bon]
impl KvServiceConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any duration is zero or
    /// `max_heartbeat_failures` is zero.
    #[builder]
    pub fn new(
        #[builder(default = DEFAULT_HEARTBEAT_INTERVAL)] heartbeat_interval: Duration,
        #[builder(default = DEFAULT_MAX_HEARTBEAT_FAILURES)] max_heartbeat_failures: u32,
        #[builder(default = DEFAULT_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)] shutdown_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { heartbeat_interval, max_heartbeat_failures, request_timeout, shutdown_timeout };
        config.validate()?;
        Ok(config)
    }

    /// Checks every field, for configurations obtained by deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::new("heartbeat_interval", "must be greater than zero"));
        }
        if self.max_heartbeat_failures == 0 {
            return Err(ConfigError::new("max_heartbeat_failures", "must be at least 1"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::new("request_timeout", "must be greater than zero"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::new("shutdown_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Interval between heartbeat pings.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Consecutive failed pings tolerated before the connection is reset.
    #[must_use]
    pub fn max_heartbeat_failures(&self) -> u32 {
        self.max_heartbeat_failures
    }

    /// How long a caller waits for the coordinator to answer.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// How long shutdown waits for the coordinator to exit.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }
}

impl Default for KvServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_heartbeat_failures: DEFAULT_MAX_HEARTBEAT_FAILURES,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}
