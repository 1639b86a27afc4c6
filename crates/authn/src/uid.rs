//! Random identifiers and keys.
//!
//! Identifiers are a big-endian microsecond timestamp followed by random
//! bytes, base64url encoded without padding, so they sort roughly by creation
//! time and never contain `:`.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroizing;

/// Random bytes in a user id.
pub const USERID_RANDOM_BYTES: usize = 8;
/// Random bytes in a session id.
pub const SESSION_ID_RANDOM_BYTES: usize = 8;
/// Bytes in a session key.
pub const SESSION_KEY_BYTES: usize = 16;

/// Creates a time-prefixed identifier with `random_bytes` bytes of entropy.
#[must_use]
pub fn new_uid(random_bytes: usize) -> String {
    let micros = Utc::now().timestamp_micros().to_be_bytes();
    let mut bytes = vec![0u8; micros.len() + random_bytes];
    bytes[..micros.len()].copy_from_slice(&micros);
    OsRng.fill_bytes(&mut bytes[micros.len()..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Creates a purely random secret of `len` bytes, base64url encoded.
#[must_use]
pub fn new_secret(len: usize) -> Zeroizing<String> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut bytes);
    Zeroizing::new(URL_SAFE_NO_PAD.encode(&*bytes))
}

/// Returns `true` if `s` is non-empty base64url without padding.
#[must_use]
pub fn is_base64url(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_shape() {
        let id = new_uid(SESSION_ID_RANDOM_BYTES);
        // 16 bytes encode to 22 characters without padding.
        assert_eq!(id.len(), 22);
        assert!(is_base64url(&id));
        assert_ne!(id, new_uid(SESSION_ID_RANDOM_BYTES));
    }

    #[test]
    fn test_secret_shape() {
        let key = new_secret(SESSION_KEY_BYTES);
        assert_eq!(key.len(), 22);
        assert!(is_base64url(&key));
        assert!(!key.contains(':'));
    }

    #[test]
    fn test_is_base64url() {
        assert!(is_base64url("abc-_09"));
        assert!(!is_base64url(""));
        assert!(!is_base64url("ab:c"));
        assert!(!is_base64url("abc="));
    }
}
