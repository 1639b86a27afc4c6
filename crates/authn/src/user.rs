//! User records, password hashing and the user repository.

use std::collections::HashMap;

use argon2::Argon2;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use password_hash::{
    PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString, rand_core::OsRng,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{AuthError, Result},
    rank::Rank,
    uid::{USERID_RANDOM_BYTES, new_uid},
};

/// A persisted user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique, immutable identifier.
    pub userid: String,
    /// Unique login name.
    pub username: String,
    /// Permission tags, persisted as the sorted comma-joined string.
    pub auth_tags: Rank,
    /// PHC-format password hash.
    pub pass_hash: String,
    /// Unique email address.
    pub email: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Creation time, seconds since epoch.
    pub creation_time: i64,
}

impl User {
    /// Creates a base user with a fresh id and a hashed password.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if hashing fails.
    pub fn new(
        username: impl Into<String>,
        password: &str,
        email: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            userid: new_uid(USERID_RANDOM_BYTES),
            username: username.into(),
            auth_tags: Rank::base_user(),
            pass_hash: PasswordHasher::new().hash(password)?,
            email: email.into(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            creation_time: Utc::now().timestamp(),
        })
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User")
            .field("userid", &self.userid)
            .field("username", &self.username)
            .field("auth_tags", &self.auth_tags)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

/// Shortest accepted username.
pub const MIN_USERNAME_LENGTH: usize = 3;
/// Shortest accepted password.
pub const MIN_PASSWORD_LENGTH: usize = 10;

/// Rejects usernames shorter than [`MIN_USERNAME_LENGTH`].
///
/// # Errors
///
/// Returns [`AuthError::BadRequest`].
pub fn validate_username(username: &str) -> Result<()> {
    if username.chars().count() < MIN_USERNAME_LENGTH {
        return Err(AuthError::bad_request(format!(
            "username must be at least {MIN_USERNAME_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Rejects passwords shorter than [`MIN_PASSWORD_LENGTH`].
///
/// # Errors
///
/// Returns [`AuthError::BadRequest`].
pub fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::bad_request(format!(
            "password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Rejects addresses not of the form `local@domain.tld`.
///
/// The local part allows `[a-z0-9._%+-]`, the domain `[a-z0-9.-]` and the
/// top-level domain `[a-z]`, all lowercase.
///
/// # Errors
///
/// Returns [`AuthError::BadRequest`].
pub fn validate_email(email: &str) -> Result<()> {
    if is_valid_email(email) {
        Ok(())
    } else {
        Err(AuthError::bad_request("email is invalid"))
    }
}

fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    let local_ok = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || "._%+-".contains(c);
    let host_ok = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || ".-".contains(c);
    !local.is_empty()
        && local.chars().all(local_ok)
        && !host.is_empty()
        && host.chars().all(host_ok)
        && !tld.is_empty()
        && tld.chars().all(|c| c.is_ascii_lowercase())
}

/// Argon2id password hashing over PHC strings.
#[derive(Default, Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    /// A hasher with the default Argon2id parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `password` with a fresh random salt.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if hashing fails.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AuthError::internal(format!("failed to hash password: {e}")))
    }

    /// Checks `password` against a stored hash.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if the stored hash is malformed.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash)
            .map_err(|e| AuthError::internal(format!("malformed password hash: {e}")))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::internal(format!("failed to verify password: {e}"))),
        }
    }
}

/// Durable storage of users.
///
/// Lookups of a missing user return [`AuthError::NotFound`]; inserts and
/// updates that would duplicate an id, username or email return
/// [`AuthError::Conflict`].
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Looks a user up by id.
    async fn get_by_id(&self, userid: &str) -> Result<User>;

    /// Looks a user up by username.
    async fn get_by_username(&self, username: &str) -> Result<User>;

    /// Looks a user up by email.
    async fn get_by_email(&self, email: &str) -> Result<User>;

    /// Stores a new user.
    async fn insert(&self, user: &User) -> Result<()>;

    /// Replaces a stored user.
    async fn update(&self, user: &User) -> Result<()>;

    /// Checks `password` against the user's hash.
    fn validate_pass(&self, password: &str, user: &User) -> Result<bool> {
        PasswordHasher::new().verify(password, &user.pass_hash)
    }

    /// Replaces the user's hash with one of `new_password`.
    fn rehash_pass(&self, user: &mut User, new_password: &str) -> Result<()> {
        user.pass_hash = PasswordHasher::new().hash(new_password)?;
        Ok(())
    }
}

/// In-memory [`UserRepository`] with unique username and email indexes.
#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    /// Returns `true` if no users are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    fn find(&self, what: &str, pred: impl Fn(&User) -> bool) -> Result<User> {
        self.users
            .read()
            .values()
            .find(|u| pred(u))
            .cloned()
            .ok_or_else(|| AuthError::not_found(format!("user {what}")))
    }

    fn check_unique(users: &HashMap<String, User>, user: &User) -> Result<()> {
        for other in users.values().filter(|o| o.userid != user.userid) {
            if other.username == user.username {
                return Err(AuthError::conflict("username already taken"));
            }
            if other.email == user.email {
                return Err(AuthError::conflict("email already in use"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn get_by_id(&self, userid: &str) -> Result<User> {
        self.users
            .read()
            .get(userid)
            .cloned()
            .ok_or_else(|| AuthError::not_found(format!("user {userid}")))
    }

    async fn get_by_username(&self, username: &str) -> Result<User> {
        self.find(username, |u| u.username == username)
    }

    async fn get_by_email(&self, email: &str) -> Result<User> {
        self.find(email, |u| u.email == email)
    }

    async fn insert(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if users.contains_key(&user.userid) {
            return Err(AuthError::conflict("userid already exists"));
        }
        Self::check_unique(&users, user)?;
        users.insert(user.userid.clone(), user.clone());
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if !users.contains_key(&user.userid) {
            return Err(AuthError::not_found(format!("user {}", user.userid)));
        }
        Self::check_unique(&users, user)?;
        users.insert(user.userid.clone(), user.clone());
        Ok(())
    }
}
