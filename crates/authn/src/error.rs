//! Authentication error types.
//!
//! [`AuthError`] is the service-level taxonomy. Every variant maps onto an
//! [`ErrorKind`] that tells the caller whether the failure is the client's
//! fault, a client-facing absence, or an infrastructure fault, and onto an
//! HTTP-style status code via [`AuthError::status`].

use std::sync::Arc;

use thiserror::Error;
use warden_kvstore::KvError;

/// Type alias for boxed errors that can be cloned.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Coarse classification of an [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input or failed authentication. Never logged as a fault.
    User,
    /// A client-facing absence.
    NotFound,
    /// Infrastructure failure.
    Internal,
}

/// Authentication and authorization errors.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`; new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Malformed, mis-signed, expired or stale token.
    #[error("Invalid token: {message}")]
    InvalidToken {
        /// What was wrong with the token.
        message: String,
    },

    /// The caller may not perform the operation.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Why the operation was refused.
        message: String,
    },

    /// The request itself is invalid.
    #[error("Bad request: {message}")]
    BadRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// A requested record does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// The operation conflicts with existing state.
    #[error("Conflict: {message}")]
    Conflict {
        /// What conflicted.
        message: String,
    },

    /// The key-value cache failed.
    #[error("Cache error: {0}")]
    Cache(#[source] KvError),

    /// A durable repository failed.
    #[error("Repository error: {message}")]
    Repository {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Any other internal failure.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },
}

impl AuthError {
    /// Creates an [`AuthError::InvalidToken`].
    #[must_use]
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken { message: message.into() }
    }

    /// Creates an [`AuthError::Forbidden`].
    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden { message: message.into() }
    }

    /// Creates an [`AuthError::BadRequest`].
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    /// Creates an [`AuthError::NotFound`].
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates an [`AuthError::Conflict`].
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Creates an [`AuthError::Repository`] without a source.
    #[must_use]
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository { message: message.into(), source: None }
    }

    /// Creates an [`AuthError::Repository`] wrapping `source`.
    #[must_use]
    pub fn repository_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Repository { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates an [`AuthError::Internal`] without a source.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates an [`AuthError::Internal`] wrapping `source`.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Classifies the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredentials
            | Self::InvalidToken { .. }
            | Self::Forbidden { .. }
            | Self::BadRequest { .. }
            | Self::Conflict { .. } => ErrorKind::User,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cache(_) | Self::Repository { .. } | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// HTTP-style status code for the error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::InvalidCredentials | Self::InvalidToken { .. } => 401,
            Self::Forbidden { .. } => 403,
            Self::BadRequest { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::Cache(_) | Self::Repository { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Returns `true` if this is an [`AuthError::NotFound`].
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` for client-caused failures.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        self.kind() == ErrorKind::User
    }
}

impl From<KvError> for AuthError {
    fn from(err: KvError) -> Self {
        AuthError::Cache(err)
    }
}

impl From<RankError> for AuthError {
    fn from(err: RankError) -> Self {
        AuthError::bad_request(err.to_string())
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        AuthError::internal_with_source("failed to issue token", err)
    }
}

/// A rank string or tag that matches none of the recognized grammars.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RankError {
    /// The tag is too long or has an unknown shape.
    #[error("Illegal rank string: {tag}")]
    InvalidRank {
        /// The offending tag.
        tag: String,
    },
}

impl RankError {
    /// Creates a [`RankError::InvalidRank`].
    #[must_use]
    pub fn invalid_rank(tag: impl Into<String>) -> Self {
        Self::InvalidRank { tag: tag.into() }
    }
}

/// Failures building or signing tokens.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TokenError {
    /// The signing key material is unusable.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// Encoding a token failed.
    #[error("Failed to encode token")]
    Encode(#[source] jsonwebtoken::errors::Error),
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::error::Error;

    use rstest::rstest;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AuthError::InvalidCredentials.to_string(), "Invalid credentials");
        assert_eq!(
            AuthError::invalid_token("malformed refresh token").to_string(),
            "Invalid token: malformed refresh token"
        );
        assert_eq!(
            AuthError::forbidden("forbidden rank edit").to_string(),
            "Forbidden: forbidden rank edit"
        );
        assert_eq!(
            RankError::invalid_rank("foo.bar").to_string(),
            "Illegal rank string: foo.bar"
        );
    }

    #[rstest]
    #[case(AuthError::InvalidCredentials, ErrorKind::User, 401)]
    #[case(AuthError::invalid_token("x"), ErrorKind::User, 401)]
    #[case(AuthError::forbidden("x"), ErrorKind::User, 403)]
    #[case(AuthError::bad_request("x"), ErrorKind::User, 400)]
    #[case(AuthError::conflict("x"), ErrorKind::User, 409)]
    #[case(AuthError::not_found("x"), ErrorKind::NotFound, 404)]
    #[case(AuthError::Cache(KvError::Timeout), ErrorKind::Internal, 500)]
    #[case(AuthError::repository("x"), ErrorKind::Internal, 500)]
    #[case(AuthError::internal("x"), ErrorKind::Internal, 500)]
    fn test_kind_and_status(#[case] err: AuthError, #[case] kind: ErrorKind, #[case] status: u16) {
        assert_eq!(err.kind(), kind);
        assert_eq!(err.status(), status);
    }

    #[test]
    fn test_cache_error_preserves_source_chain() {
        let err: AuthError = KvError::connection("connection refused").into();
        assert_eq!(err.to_string(), "Cache error: Connection error: connection refused");

        let source = err.source().expect("cache error should expose its source");
        let kv = source.downcast_ref::<KvError>().expect("source should be a KvError");
        assert!(matches!(kv, KvError::Connection { .. }));
    }

    #[test]
    fn test_rank_error_is_bad_request() {
        let err: AuthError = RankError::invalid_rank("nope").into();
        assert!(matches!(err, AuthError::BadRequest { .. }));
        assert!(err.is_user_error());
    }

    #[test]
    fn test_token_error_is_internal() {
        let err: AuthError = TokenError::InvalidKey("short".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.source().is_some());
    }
}
