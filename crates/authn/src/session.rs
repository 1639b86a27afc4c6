//! Server-side sessions.
//!
//! A session is one authenticated device. Its row lives in a durable
//! [`SessionRepository`] and holds only a hash of the session key; the
//! plaintext key travels inside the refresh token and is mirrored in the
//! `sessions` cache subtree for fast lookup:
//!
//! ```text
//! refresh token jti:   <session_id>:<key>
//! session row:         session_id -> { userid, key_hash = H(key), ... }
//! cache:               sessions:<session_id> -> key   (refresh lifetime)
//! ```
//!
//! Rotating the key (on every refresh) replaces both the row's hash and the
//! cached key, so the previous refresh token stops validating.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use warden_kvstore::{KvStore, Subtree};
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    uid::{SESSION_ID_RANDOM_BYTES, SESSION_KEY_BYTES, new_secret, new_uid},
    user::User,
};

/// Cache subtree holding plaintext session keys.
pub const SESSION_CACHE_PREFIX: &str = "sessions";

/// A persisted session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Globally unique, immutable id.
    pub session_id: String,
    /// Owner of the session.
    pub userid: String,
    /// Hash of the current session key.
    pub key_hash: String,
    /// Creation time, seconds since epoch.
    pub creation_time: i64,
    /// Last authentication time, seconds since epoch.
    pub auth_time: i64,
    /// Client address at the last authentication.
    pub ip_addr: String,
    /// Client user agent at the last authentication.
    pub user_agent: String,
}

/// A plaintext session key. Scrubbed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey(Zeroizing<String>);

impl SessionKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(new_secret(SESSION_KEY_BYTES))
    }

    /// Wraps a key read from a token or the cache.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(Zeroizing::new(key.into()))
    }

    /// The key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hash persisted in the session row.
    #[must_use]
    pub fn hash(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.0.as_bytes()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Durable storage of sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Loads a session. Missing sessions are [`AuthError::NotFound`].
    async fn get(&self, session_id: &str) -> Result<Session>;

    /// A page of the user's sessions, most recently authenticated first.
    async fn list_for_user(&self, userid: &str, limit: usize, offset: usize)
    -> Result<Vec<Session>>;

    /// Stores a new session. Duplicate ids are [`AuthError::Conflict`].
    async fn insert(&self, session: &Session) -> Result<()>;

    /// Replaces a stored session. Missing sessions are [`AuthError::NotFound`].
    async fn update(&self, session: &Session) -> Result<()>;

    /// Deletes sessions by id. Unknown ids are ignored.
    async fn delete(&self, session_ids: &[String]) -> Result<()>;

    /// Deletes every session of the user, returning the deleted ids.
    async fn delete_for_user(&self, userid: &str) -> Result<Vec<String>>;
}

/// In-memory [`SessionRepository`].
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if no sessions are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn get(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AuthError::not_found(format!("session {session_id}")))
    }

    async fn list_for_user(
        &self,
        userid: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> =
            self.sessions.read().values().filter(|s| s.userid == userid).cloned().collect();
        sessions.sort_by(|a, b| {
            b.auth_time.cmp(&a.auth_time).then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    async fn insert(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&session.session_id) {
            return Err(AuthError::conflict("session id already exists"));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn update(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&session.session_id) {
            Some(stored) => {
                *stored = session.clone();
                Ok(())
            },
            None => Err(AuthError::not_found(format!("session {}", session.session_id))),
        }
    }

    async fn delete(&self, session_ids: &[String]) -> Result<()> {
        let mut sessions = self.sessions.write();
        for id in session_ids {
            sessions.remove(id);
        }
        Ok(())
    }

    async fn delete_for_user(&self, userid: &str) -> Result<Vec<String>> {
        let mut sessions = self.sessions.write();
        let ids: Vec<String> =
            sessions.values().filter(|s| s.userid == userid).map(|s| s.session_id.clone()).collect();
        for id in &ids {
            sessions.remove(id);
        }
        Ok(ids)
    }
}

/// Session bookkeeping over a durable repository and the key cache.
pub struct SessionStore {
    repo: Arc<dyn SessionRepository>,
    keys: Subtree,
    key_ttl: Duration,
    repopulate_ttl: Duration,
}

impl SessionStore {
    /// Creates a store caching keys under [`SESSION_CACHE_PREFIX`] of `kv`.
    ///
    /// Keys written on login and rotation live for `key_ttl` (the refresh
    /// lifetime); keys restored after a cache miss live for `repopulate_ttl`.
    #[must_use]
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        kv: Arc<dyn KvStore>,
        key_ttl: Duration,
        repopulate_ttl: Duration,
    ) -> Self {
        Self { repo, keys: Subtree::new(kv, SESSION_CACHE_PREFIX), key_ttl, repopulate_ttl }
    }

    /// A fresh, unsaved session for `user` with a new id and key.
    #[must_use]
    pub fn new_session(&self, user: &User, ip_addr: &str, user_agent: &str) -> (Session, SessionKey) {
        let key = SessionKey::generate();
        let now = Utc::now().timestamp();
        let session = Session {
            session_id: new_uid(SESSION_ID_RANDOM_BYTES),
            userid: user.userid.clone(),
            key_hash: key.hash(),
            creation_time: now,
            auth_time: now,
            ip_addr: ip_addr.to_owned(),
            user_agent: user_agent.to_owned(),
        };
        (session, key)
    }

    /// Loads the user's session and stamps it with a new authentication.
    ///
    /// The returned session is not saved.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] if the session does not exist or belongs
    /// to another user.
    pub async fn from_session_id(
        &self,
        session_id: &str,
        userid: &str,
        ip_addr: &str,
        user_agent: &str,
    ) -> Result<Session> {
        let mut session = self.get(session_id).await?;
        if session.userid != userid {
            return Err(AuthError::not_found(format!("session {session_id}")));
        }
        session.auth_time = Utc::now().timestamp();
        ip_addr.clone_into(&mut session.ip_addr);
        user_agent.clone_into(&mut session.user_agent);
        Ok(session)
    }

    /// Loads a session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NotFound`] if the session does not exist.
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        self.repo.get(session_id).await
    }

    /// Returns `true` if the session exists and belongs to `userid`.
    ///
    /// # Errors
    ///
    /// Returns repository failures other than absence.
    pub async fn session_exists(&self, userid: &str, session_id: &str) -> Result<bool> {
        match self.repo.get(session_id).await {
            Ok(session) => Ok(session.userid == userid),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// A page of the user's sessions.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn list(&self, userid: &str, limit: usize, offset: usize) -> Result<Vec<Session>> {
        self.repo.list_for_user(userid, limit, offset).await
    }

    /// Saves a new session and caches its key.
    ///
    /// # Errors
    ///
    /// Returns repository failures. Cache failures are logged only.
    pub async fn insert(&self, session: &Session, key: &SessionKey) -> Result<()> {
        self.repo.insert(session).await?;
        self.cache_key(&session.session_id, key, self.key_ttl).await;
        Ok(())
    }

    /// Saves the session's row, keeping its key.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn update(&self, session: &Session) -> Result<()> {
        self.repo.update(session).await
    }

    /// Replaces the session key, saving the new hash and caching the key.
    ///
    /// The cached key is cleared before the new hash is saved, so a key that
    /// was rotated out can never be served from the cache. If the new key
    /// cannot be cached, lookups fall back to the saved hash.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Cache`] if the old key cannot be cleared, in which
    /// case nothing is rotated. Returns repository failures.
    pub async fn set_key(&self, session: &mut Session, key: &SessionKey) -> Result<()> {
        fail::fail_point!("session-before-set-key", |_| {
            Err(AuthError::repository("injected session update failure"))
        });
        let cached = [session.session_id.clone()];
        self.keys.del(&cached).await.map_err(|err| {
            tracing::error!(
                actiontype = "clearsessionkey",
                session_id = %session.session_id,
                error = %err,
                "Failed to clear session key before rotation"
            );
            AuthError::Cache(err)
        })?;

        session.key_hash = key.hash();
        self.repo.update(session).await?;

        if let Err(err) = self.keys.set(&session.session_id, key.as_str(), Some(self.key_ttl)).await
        {
            tracing::error!(
                actiontype = "setsessionkey",
                error = %err,
                "Failed to cache session key"
            );
            // A lookup between the clear and the update may have restored the old key.
            self.clear_keys(&cached).await;
        }
        Ok(())
    }

    /// Resolves the live key of a session, given the key a client presented.
    ///
    /// A cached key is returned as is. On a cache miss or cache failure the
    /// presented key is checked against the persisted hash and, if it matches,
    /// written back to the cache. Returns `None` if the session is unknown or
    /// the presented key is stale.
    ///
    /// # Errors
    ///
    /// Returns repository failures other than absence.
    pub async fn get_key(&self, session_id: &str, presented: &str) -> Result<Option<SessionKey>> {
        match self.keys.get(session_id).await {
            Ok(Some(key)) => return Ok(Some(SessionKey::new(key))),
            Ok(None) => {},
            Err(err) => {
                tracing::error!(
                    actiontype = "getsessionkey",
                    error = %err,
                    "Failed to get session key from cache"
                );
            },
        }

        let session = match self.repo.get(session_id).await {
            Ok(session) => session,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        let presented = SessionKey::new(presented);
        if presented.hash() != session.key_hash {
            return Ok(None);
        }
        self.cache_key(session_id, &presented, self.repopulate_ttl).await;
        Ok(Some(presented))
    }

    /// Deletes sessions and their cached keys.
    ///
    /// # Errors
    ///
    /// Returns repository failures. Cache failures are logged only.
    pub async fn delete(&self, session_ids: &[String]) -> Result<()> {
        if session_ids.is_empty() {
            return Ok(());
        }
        self.repo.delete(session_ids).await?;
        self.clear_keys(session_ids).await;
        Ok(())
    }

    /// Deletes every session of the user, returning the deleted ids.
    ///
    /// # Errors
    ///
    /// Returns repository failures. Cache failures are logged only.
    pub async fn delete_all_for_user(&self, userid: &str) -> Result<Vec<String>> {
        let ids = self.repo.delete_for_user(userid).await?;
        if !ids.is_empty() {
            self.clear_keys(&ids).await;
        }
        Ok(ids)
    }

    async fn cache_key(&self, session_id: &str, key: &SessionKey, ttl: Duration) {
        if let Err(err) = self.keys.set(session_id, key.as_str(), Some(ttl)).await {
            tracing::error!(
                actiontype = "setsessionkey",
                error = %err,
                "Failed to cache session key"
            );
        }
    }

    async fn clear_keys(&self, session_ids: &[String]) {
        if let Err(err) = self.keys.del(session_ids).await {
            tracing::error!(
                actiontype = "clearsessionkey",
                error = %err,
                "Failed to clear session keys from cache"
            );
        }
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("keys", &self.keys)
            .field("key_ttl", &self.key_ttl)
            .field("repopulate_ttl", &self.repopulate_ttl)
            .finish_non_exhaustive()
    }
}
