//! Health reporting for the key-value coordinator.
//!
//! [`KvService::health`](crate::KvService::health) returns a [`HealthStatus`]
//! built from the coordinator's heartbeat state:
//!
//! - **Healthy**: the last ping succeeded.
//! - **Degraded**: recent pings failed but the failure threshold has not been reached.
//! - **Unhealthy**: no client is connected, or the threshold was reached and the credential was
//!   invalidated.

use std::{collections::HashMap, fmt, time::Duration};

/// Health of a key-value store connection.
#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// The store is reachable.
    Healthy(HealthMetadata),
    /// The store answered recently but pings are failing.
    Degraded(HealthMetadata, String),
    /// The store cannot serve requests.
    Unhealthy(HealthMetadata, String),
}

impl HealthStatus {
    /// Creates a `Healthy` status.
    #[must_use = "creating a status has no side effects"]
    pub fn healthy(metadata: HealthMetadata) -> Self {
        Self::Healthy(metadata)
    }

    /// Creates a `Degraded` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn degraded(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Degraded(metadata, reason.into())
    }

    /// Creates an `Unhealthy` status with a reason.
    #[must_use = "creating a status has no side effects"]
    pub fn unhealthy(metadata: HealthMetadata, reason: impl Into<String>) -> Self {
        Self::Unhealthy(metadata, reason.into())
    }

    /// Returns `true` if the store is fully healthy.
    #[must_use = "health status predicates should be checked"]
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy(_))
    }

    /// Returns `true` if the store is degraded.
    #[must_use = "health status predicates should be checked"]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(..))
    }

    /// Returns `true` if the store is unhealthy.
    #[must_use = "health status predicates should be checked"]
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Unhealthy(..))
    }

    /// Returns the metadata associated with this status.
    #[must_use]
    pub fn metadata(&self) -> &HealthMetadata {
        match self {
            Self::Healthy(m) | Self::Degraded(m, _) | Self::Unhealthy(m, _) => m,
        }
    }

    /// Returns the degradation or failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Healthy(_) => None,
            Self::Degraded(_, reason) | Self::Unhealthy(_, reason) => Some(reason),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy(m) => write!(f, "healthy ({}ms)", m.check_duration.as_millis()),
            Self::Degraded(m, reason) => {
                write!(f, "degraded: {} ({}ms)", reason, m.check_duration.as_millis())
            },
            Self::Unhealthy(m, reason) => {
                write!(f, "unhealthy: {} ({}ms)", reason, m.check_duration.as_millis())
            },
        }
    }
}

/// Metadata about a health check result.
#[derive(Debug, Clone)]
pub struct HealthMetadata {
    /// How long the check itself took.
    pub check_duration: Duration,
    /// Identifier for the store (e.g. "memory", "kvservice").
    pub backend: String,
    /// Store-specific details such as `heartbeat_failures`.
    pub details: HashMap<String, String>,
}

impl HealthMetadata {
    /// Creates metadata with the given check duration and backend name.
    #[must_use]
    pub fn new(check_duration: Duration, backend: impl Into<String>) -> Self {
        Self { check_duration, backend: backend.into(), details: HashMap::new() }
    }

    /// Adds a detail entry, returning `self` for chaining.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}
