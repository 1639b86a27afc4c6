//! Token algorithm and session binding checks.
//!
//! Only EdDSA (Ed25519) tokens are accepted; symmetric algorithms and `none`
//! are always rejected before any signature work is done. Refresh tokens bind
//! to a session through an `id` of the form `<session_id>:<key>`, which
//! [`split_session_binding`] takes apart.

use crate::{error::AuthError, uid::is_base64url};

/// Forbidden JWT algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, so anyone holding the verifier could mint tokens
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Accepted JWT algorithms.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA"];

/// Longest session id the session table holds.
pub const MAX_SESSION_ID_LENGTH: usize = 63;

/// Separator between session id and key in a refresh token `id`.
pub const SESSION_BINDING_SEPARATOR: char = ':';

/// Validate a JWT algorithm name against the accepted list.
///
/// # Errors
///
/// Returns [`AuthError::InvalidToken`] if the algorithm is forbidden or not in
/// [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use warden_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("RS256").is_err());
/// assert!(validate_algorithm("HS256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AuthError::invalid_token(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::invalid_token(format!(
            "Algorithm '{alg}' is not in accepted list (only EdDSA is supported)"
        )));
    }

    Ok(())
}

/// Returns `true` if `session_id` has the shape of an issued session id.
#[must_use]
pub fn is_valid_session_id(session_id: &str) -> bool {
    session_id.len() <= MAX_SESSION_ID_LENGTH && is_base64url(session_id)
}

/// Splits a refresh token binding into `(session_id, key)`.
///
/// Returns `None` unless the binding has exactly two well-formed parts.
///
/// ```
/// use warden_authn::validation::split_session_binding;
///
/// assert_eq!(split_session_binding("abc:def"), Some(("abc", "def")));
/// assert_eq!(split_session_binding("abc"), None);
/// assert_eq!(split_session_binding("a:b:c"), None);
/// ```
#[must_use]
pub fn split_session_binding(binding: &str) -> Option<(&str, &str)> {
    let (session_id, key) = binding.split_once(SESSION_BINDING_SEPARATOR)?;
    if !is_valid_session_id(session_id) || !is_base64url(key) {
        return None;
    }
    Some((session_id, key))
}

/// Joins a session id and key into a refresh token binding.
#[must_use]
pub fn session_binding(session_id: &str, key: &str) -> String {
    format!("{session_id}{SESSION_BINDING_SEPARATOR}{key}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_validate_algorithm_eddsa_accepted() {
        assert!(validate_algorithm("EdDSA").is_ok());
    }

    #[test]
    fn test_forbidden_algorithms_each_rejected_with_security_message() {
        for alg in FORBIDDEN_ALGORITHMS {
            let result = validate_algorithm(alg);
            assert!(
                matches!(result, Err(AuthError::InvalidToken { ref message }) if message.contains("not allowed for security reasons")),
                "Expected security rejection for forbidden algorithm '{alg}'"
            );
        }
    }

    #[rstest]
    #[case("RS256")]
    #[case("ES256")]
    #[case("")]
    fn test_validate_algorithm_not_in_list(#[case] alg: &str) {
        let result = validate_algorithm(alg);
        assert!(
            matches!(result, Err(AuthError::InvalidToken { ref message }) if message.contains("not in accepted list"))
        );
    }

    #[rstest]
    #[case("sid:key", Some(("sid", "key")))]
    #[case("AAECAw-_:ZZ", Some(("AAECAw-_", "ZZ")))]
    #[case("sid", None)]
    #[case("sid:", None)]
    #[case(":key", None)]
    #[case("a:b:c", None)]
    #[case("s id:key", None)]
    fn test_split_session_binding(#[case] binding: &str, #[case] expected: Option<(&str, &str)>) {
        assert_eq!(split_session_binding(binding), expected);
    }

    #[test]
    fn test_overlong_session_id_is_rejected() {
        let long = "a".repeat(MAX_SESSION_ID_LENGTH + 1);
        assert!(!is_valid_session_id(&long));
        assert!(split_session_binding(&session_binding(&long, "key")).is_none());
        assert!(is_valid_session_id(&long[1..]));
    }

    #[test]
    fn test_binding_round_trip() {
        let binding = session_binding("sid", "key");
        assert_eq!(binding, "sid:key");
        assert_eq!(split_session_binding(&binding), Some(("sid", "key")));
    }
}
