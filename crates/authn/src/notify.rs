//! New-login notifications.
//!
//! Delivery (mail rendering, queues) lives outside this crate. The service
//! hands a [`NewLogin`] to a [`NewLoginNotifier`] whenever a login creates a
//! session, and only logs a failed delivery.

use async_trait::async_trait;

use crate::error::BoxError;

/// A login that created a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogin {
    /// The user who logged in.
    pub userid: String,
    /// Their username.
    pub username: String,
    /// Their email address.
    pub email: String,
    /// The new session.
    pub session_id: String,
    /// Client address of the login.
    pub ip_addr: String,
    /// Client user agent of the login.
    pub user_agent: String,
    /// Login time, seconds since epoch.
    pub login_time: i64,
}

/// Delivers new-login notifications.
#[async_trait]
pub trait NewLoginNotifier: Send + Sync {
    /// Sends a notification for `login`.
    async fn notify(&self, login: &NewLogin) -> Result<(), BoxError>;
}
