//! Configuration for the auth service.

use std::time::Duration;

use serde::{Deserialize, Serialize};
pub use warden_kvstore::ConfigError;

use crate::rank::{Rank, TAG_ADMIN, TAG_USER};

/// Default token issuer.
pub const DEFAULT_ISSUER: &str = "warden";

/// Default access token lifetime.
pub const DEFAULT_ACCESS_TIME: Duration = Duration::from_secs(5 * 60);

/// Default refresh token lifetime, half a year.
pub const DEFAULT_REFRESH_TIME: Duration = Duration::from_secs(4380 * 60 * 60);

/// Default lifetime of a session key restored into the cache after a miss.
pub const DEFAULT_REFRESH_CACHE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of role cache entries.
pub const DEFAULT_ROLE_CACHE_TIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Tags copied from the user's rank into issued tokens by default.
#[must_use]
pub fn default_role_summary() -> Rank {
    [TAG_USER, TAG_ADMIN].into_iter().collect()
}

/// Configuration for [`AuthService`](crate::AuthService).
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use warden_authn::AuthConfig;
///
/// let config = AuthConfig::builder()
///     .issuer("example")
///     .access_time(Duration::from_secs(60))
///     .build()?;
/// assert_eq!(config.issuer(), "example");
/// assert!(config.role_summary().has("admin"));
/// # Ok::<(), warden_authn::config::ConfigError>(())
/// ```
///
/// Deserializing uses human-readable durations:
///
/// ```
/// use warden_authn::AuthConfig;
///
/// let config: AuthConfig = serde_json::from_str(
///     r#"{"access_time": "10m", "refresh_time": "30days", "role_summary": "user"}"#,
/// )?;
/// assert_eq!(config.access_time().as_secs(), 600);
/// assert!(!config.role_summary().has("admin"));
/// # Ok::<(), serde_json::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// `iss` of issued tokens.
    #[serde(default = "default_issuer")]
    issuer: String,

    /// Access token lifetime.
    #[serde(with = "humantime_serde", default = "default_access_time")]
    access_time: Duration,

    /// Refresh and session token lifetime, and the TTL of cached session keys.
    #[serde(with = "humantime_serde", default = "default_refresh_time")]
    refresh_time: Duration,

    /// TTL of a session key restored into the cache after a miss.
    #[serde(with = "humantime_serde", default = "default_refresh_cache_time")]
    refresh_cache_time: Duration,

    /// TTL of role membership flags and role summaries.
    #[serde(with = "humantime_serde", default = "default_role_cache_time")]
    role_cache_time: Duration,

    /// Whether a login creating a new session notifies the user.
    #[serde(default = "default_new_login_notify")]
    new_login_notify: bool,

    /// Tags copied from the user's rank into issued tokens.
    #[serde(default = "default_role_summary")]
    role_summary: Rank,
}

fn default_issuer() -> String {
    DEFAULT_ISSUER.to_owned()
}

fn default_access_time() -> Duration {
    DEFAULT_ACCESS_TIME
}

fn default_refresh_time() -> Duration {
    DEFAULT_REFRESH_TIME
}

fn default_refresh_cache_time() -> Duration {
    DEFAULT_REFRESH_CACHE_TIME
}

fn default_role_cache_time() -> Duration {
    DEFAULT_ROLE_CACHE_TIME
}

fn default_new_login_notify() -> bool {
    true
}

#[bon::bon]
impl AuthConfig {
    /// Creates a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the issuer is empty, any duration is zero,
    /// or access tokens would outlive refresh tokens.
    #[builder]
    pub fn new(
        #[builder(into, default = DEFAULT_ISSUER.to_owned())] issuer: String,
        #[builder(default = DEFAULT_ACCESS_TIME)] access_time: Duration,
        #[builder(default = DEFAULT_REFRESH_TIME)] refresh_time: Duration,
        #[builder(default = DEFAULT_REFRESH_CACHE_TIME)] refresh_cache_time: Duration,
        #[builder(default = DEFAULT_ROLE_CACHE_TIME)] role_cache_time: Duration,
        #[builder(default = true)] new_login_notify: bool,
        #[builder(default = default_role_summary())] role_summary: Rank,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            issuer,
            access_time,
            refresh_time,
            refresh_cache_time,
            role_cache_time,
            new_login_notify,
            role_summary,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every field, for configurations obtained by deserialization.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.issuer.is_empty() {
            return Err(ConfigError::new("issuer", "must not be empty"));
        }
        for (field, value) in [
            ("access_time", self.access_time),
            ("refresh_time", self.refresh_time),
            ("refresh_cache_time", self.refresh_cache_time),
            ("role_cache_time", self.role_cache_time),
        ] {
            if value.is_zero() {
                return Err(ConfigError::new(field, "must be greater than zero"));
            }
        }
        if self.access_time > self.refresh_time {
            return Err(ConfigError::new("access_time", "must not exceed refresh_time"));
        }
        Ok(())
    }

    /// `iss` of issued tokens.
    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Access token lifetime.
    #[must_use]
    pub fn access_time(&self) -> Duration {
        self.access_time
    }

    /// Refresh and session token lifetime.
    #[must_use]
    pub fn refresh_time(&self) -> Duration {
        self.refresh_time
    }

    /// TTL of a session key restored into the cache after a miss.
    #[must_use]
    pub fn refresh_cache_time(&self) -> Duration {
        self.refresh_cache_time
    }

    /// TTL of role cache entries.
    #[must_use]
    pub fn role_cache_time(&self) -> Duration {
        self.role_cache_time
    }

    /// Whether new sessions trigger a notification.
    #[must_use]
    pub fn new_login_notify(&self) -> bool {
        self.new_login_notify
    }

    /// Tags copied from the user's rank into issued tokens.
    #[must_use]
    pub fn role_summary(&self) -> &Rank {
        &self.role_summary
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            access_time: DEFAULT_ACCESS_TIME,
            refresh_time: DEFAULT_REFRESH_TIME,
            refresh_cache_time: DEFAULT_REFRESH_CACHE_TIME,
            role_cache_time: DEFAULT_ROLE_CACHE_TIME,
            new_login_notify: true,
            role_summary: default_role_summary(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::builder().build().unwrap();
        assert_eq!(config, AuthConfig::default());
        assert_eq!(config.issuer(), "warden");
        assert_eq!(config.access_time(), Duration::from_secs(300));
        assert_eq!(config.refresh_time(), Duration::from_secs(15_768_000));
        assert_eq!(config.refresh_cache_time(), Duration::from_secs(86_400));
        assert_eq!(config.role_cache_time(), Duration::from_secs(86_400));
        assert!(config.new_login_notify());
        assert_eq!(config.role_summary().to_string(), "admin,user");
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: AuthConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AuthConfig::default());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<AuthConfig, _> = serde_json::from_str(r#"{"acess_time": "5m"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_role_summary_rejected() {
        let result: Result<AuthConfig, _> = serde_json::from_str(r#"{"role_summary": "root"}"#);
        assert!(result.is_err());
    }

    #[rstest]
    #[case(AuthConfig::builder().issuer("").build(), "issuer")]
    #[case(AuthConfig::builder().access_time(Duration::ZERO).build(), "access_time")]
    #[case(AuthConfig::builder().role_cache_time(Duration::ZERO).build(), "role_cache_time")]
    #[case(
        AuthConfig::builder()
            .access_time(Duration::from_secs(10))
            .refresh_time(Duration::from_secs(5))
            .build(),
        "access_time"
    )]
    fn test_validation(#[case] result: Result<AuthConfig, ConfigError>, #[case] field: &str) {
        assert_eq!(result.unwrap_err().field, field);
    }
}
