//! Key-value store error types and result alias.
//!
//! Every [`KvStore`](crate::KvStore) implementation maps its client errors to
//! [`KvError`]. Callers in the auth layer rely on the variant to decide
//! whether a failure is a cache miss, a value that cannot be interpreted, or
//! an infrastructure fault that should be logged and degraded around.
//!
//! # Error Types
//!
//! - [`KvError::NotFound`] - Key does not exist where a value was required
//! - [`KvError::Connection`] - The store cannot be reached or the client could not be built
//! - [`KvError::InvalidValue`] - A stored value has the wrong shape (e.g. `get_int` on text)
//! - [`KvError::Internal`] - Backend-specific failure
//! - [`KvError::Timeout`] - The coordinator did not answer in time
//! - [`KvError::Shutdown`] - The coordinator has stopped
//!
//! # Example
//!
//! ```
//! use warden_kvstore::{KvError, KvResult};
//!
//! fn lookup(key: &str) -> KvResult<String> {
//!     Err(KvError::not_found(key))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for key-value operations.
pub type KvResult<T> = Result<T, KvError>;

/// Errors that can occur during key-value operations.
///
/// Errors preserve their source chain via `#[source]`, so structured logs
/// can show the underlying client failure.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum KvError {
    /// The requested key was not found.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// Connection or credential error.
    ///
    /// Raised when a client cannot be built, a ping fails, or a credential
    /// cannot be read from the secret source.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// A stored value could not be interpreted.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The key holding the value.
        key: String,
        /// What was wrong with the value.
        message: String,
    },

    /// Internal backend error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation did not complete within its time limit.
    #[error("Operation timeout")]
    Timeout,

    /// The store coordinator has shut down and can no longer serve requests.
    #[error("Key-value store is shut down")]
    Shutdown,
}

impl KvError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue { key: key.into(), message: message.into() }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` if this error is a [`KvError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
