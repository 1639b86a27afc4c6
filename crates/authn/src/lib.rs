//! # Warden Authentication
//!
//! Authentication, sessions, tokens and the rank cache for Warden services.
//!
//! This crate provides:
//! - **Ranks**: permission tag sets (`user`, `admin`, `mod.<group>`, ...)
//! - **Tokens**: EdDSA-signed access, refresh and session tokens
//! - **Sessions**: durable session records with a cached key per session
//! - **Role cache**: cache-aside answers to "which of these tags does the user hold"
//! - **Auth service**: login, exchange, refresh, logout and rank edits
//!
//! ## Features
//!
//! - Only EdDSA tokens are issued and accepted
//! - Refresh tokens rotate: each refresh invalidates the token it consumed
//! - Cache outages degrade to repository reads instead of failing requests
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use warden_authn::{
//!     AuthConfig, AuthService, MemoryRoleRepository, MemorySessionRepository,
//!     MemoryUserRepository, token::generate_pkcs8_key,
//! };
//! use warden_kvstore::MemoryKv;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let signing_key = generate_pkcs8_key();
//! let auth = AuthService::builder()
//!     .config(AuthConfig::default())
//!     .signing_key(&signing_key)
//!     .users(Arc::new(MemoryUserRepository::new()))
//!     .sessions(Arc::new(MemorySessionRepository::new()))
//!     .roles(Arc::new(MemoryRoleRepository::new()))
//!     .kv(Arc::new(MemoryKv::new()))
//!     .build()?;
//!
//! let tokens = auth.login("alice", "correct horse battery", None, "127.0.0.1", "curl").await?;
//! let refresh = tokens.refresh_token.unwrap_or_default();
//! let access = auth.exchange_token(&refresh, "127.0.0.1", "curl").await?;
//! # let _ = access;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Service configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// New-login notifications.
pub mod notify;
/// Permission tag sets.
pub mod rank;
/// Role storage and cache.
pub mod role;
/// The authentication service.
pub mod service;
/// Sessions and session keys.
pub mod session;
/// First-run setup.
pub mod setup;
/// Token issuing and validation.
pub mod token;
/// Time-ordered random identifiers.
pub mod uid;
/// Users and passwords.
pub mod user;
/// Algorithm and session binding checks.
pub mod validation;

/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use config::AuthConfig;
pub use error::{AuthError, ErrorKind, RankError, Result, TokenError};
pub use notify::{NewLogin, NewLoginNotifier};
pub use rank::Rank;
pub use role::{MemoryRoleRepository, RoleCache, RoleRepository};
pub use service::{AuthService, AuthTokens};
pub use session::{MemorySessionRepository, Session, SessionKey, SessionRepository, SessionStore};
pub use setup::{MemorySetupRepository, SetupGuard, SetupRepository, SetupRequest, SetupResponse};
pub use token::{Claims, Subject, TokenIssuer};
pub use user::{MemoryUserRepository, PasswordHasher, User, UserRepository};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
