//! Shared test utilities for authentication testing.
//!
//! This module provides helpers for generating Ed25519 key pairs, crafting
//! raw JWT strings (for attack testing), recording new-login notifications
//! and wiring a complete [`AuthService`] over in-memory repositories. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! warden-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use warden_authn::testutil::{TestEnv, generate_test_keypair};
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use warden_kvstore::{MemoryKv, testutil::FlakyKv};
use zeroize::Zeroizing;

use crate::{
    config::AuthConfig,
    error::BoxError,
    notify::{NewLogin, NewLoginNotifier},
    role::MemoryRoleRepository,
    service::AuthService,
    session::MemorySessionRepository,
    token::pkcs8_from_signing_key,
    user::{MemoryUserRepository, User, UserRepository},
};

/// Generates a test Ed25519 key pair.
///
/// Returns `(pkcs8_der, public_key_base64url)` where `pkcs8_der` is the
/// private key in PKCS#8 DER format wrapped in [`Zeroizing`], and
/// `public_key_base64url` is the 32-byte public key encoded as base64url
/// without padding.
///
/// Each call generates a fresh random key pair.
#[must_use]
pub fn generate_test_keypair() -> (Zeroizing<Vec<u8>>, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key_b64 = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
    (pkcs8_from_signing_key(&signing_key), public_key_b64)
}

/// Creates a raw JWT string from arbitrary header and payload JSON.
///
/// The resulting JWT has the structure `{header_b64}.{payload_b64}.`
/// with an empty signature. This is useful for testing rejection of
/// malformed or attack JWTs (e.g., `alg: "none"`, algorithm confusion).
#[must_use]
pub fn craft_raw_jwt(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json.to_string());
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json.to_string());
    format!("{header_b64}.{payload_b64}.")
}

/// A [`NewLoginNotifier`] that records every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NewLogin>>,
    fail: bool,
}

impl RecordingNotifier {
    /// A notifier that accepts every notification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier that records and then fails every notification.
    #[must_use]
    pub fn failing() -> Self {
        Self { sent: Mutex::default(), fail: true }
    }

    /// Notifications received so far.
    #[must_use]
    pub fn sent(&self) -> Vec<NewLogin> {
        self.sent.lock().clone()
    }

    /// Number of notifications received.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl NewLoginNotifier for RecordingNotifier {
    async fn notify(&self, login: &NewLogin) -> Result<(), BoxError> {
        self.sent.lock().push(login.clone());
        if self.fail {
            return Err(Arc::new(std::io::Error::other("mail relay unavailable")));
        }
        Ok(())
    }
}

/// An [`AuthService`] wired to in-memory repositories and a [`FlakyKv`].
///
/// The repositories and cache stay reachable for assertions and fault
/// injection.
pub struct TestEnv {
    /// The service under test.
    pub service: AuthService,
    /// Backing user repository.
    pub users: Arc<MemoryUserRepository>,
    /// Backing session repository.
    pub session_repo: Arc<MemorySessionRepository>,
    /// Backing role repository.
    pub role_repo: Arc<MemoryRoleRepository>,
    /// The cache, with fault switches.
    pub kv: Arc<FlakyKv>,
    /// Notifier receiving new-login notifications.
    pub notifier: Arc<RecordingNotifier>,
}

impl TestEnv {
    /// An environment with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if the service cannot be built.
    #[must_use]
    pub fn new() -> Self {
        Self::build(AuthConfig::default(), Arc::new(RecordingNotifier::new()))
    }

    /// An environment with `config`.
    ///
    /// # Panics
    ///
    /// Panics if the service cannot be built.
    #[must_use]
    pub fn with_config(config: AuthConfig) -> Self {
        Self::build(config, Arc::new(RecordingNotifier::new()))
    }

    /// An environment notifying `notifier`.
    ///
    /// # Panics
    ///
    /// Panics if the service cannot be built.
    #[must_use]
    pub fn with_notifier(notifier: Arc<RecordingNotifier>) -> Self {
        Self::build(AuthConfig::default(), notifier)
    }

    #[allow(clippy::expect_used)]
    fn build(config: AuthConfig, notifier: Arc<RecordingNotifier>) -> Self {
        let users = Arc::new(MemoryUserRepository::new());
        let session_repo = Arc::new(MemorySessionRepository::new());
        let role_repo = Arc::new(MemoryRoleRepository::new());
        let kv = Arc::new(FlakyKv::new(MemoryKv::new()));
        let (signing_key, _) = generate_test_keypair();

        let service = AuthService::builder()
            .config(config)
            .signing_key(&signing_key)
            .users(users.clone())
            .sessions(session_repo.clone())
            .roles(role_repo.clone())
            .kv(kv.clone())
            .notifier(notifier.clone())
            .build()
            .expect("test service");

        Self { service, users, session_repo, role_repo, kv, notifier }
    }

    /// Stores a base user `username` with email `<username>@example.com`.
    ///
    /// # Panics
    ///
    /// Panics if the user cannot be stored.
    #[allow(clippy::expect_used)]
    pub async fn add_user(&self, username: &str, password: &str) -> User {
        let user = User::new(username, password, format!("{username}@example.com"), username, "Test")
            .expect("hash password");
        self.users.insert(&user).await.expect("insert user");
        user
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given
/// [`AuthError`](crate::AuthError) variant.
///
/// The result expression is evaluated once. On failure, prints the expected
/// variant and the actual result for debugging.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use warden_authn::{AuthError, assert_auth_error};
///
/// let result: Result<(), AuthError> = Err(AuthError::InvalidCredentials);
/// assert_auth_error!(result, InvalidCredentials);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        match $result {
            Err($crate::error::AuthError::$variant { .. }) => {},
            other => panic!("expected AuthError::{}, got: {:?}", stringify!($variant), other),
        }
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        match $result {
            Err($crate::error::AuthError::$variant { .. }) => {},
            other => {
                panic!("{}: expected AuthError::{}, got: {:?}", $msg, stringify!($variant), other)
            },
        }
    };
}
