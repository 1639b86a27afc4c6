//! The authentication service.
//!
//! [`AuthService`] ties users, sessions, tokens and roles together into the
//! tri-token protocol:
//!
//! | Token   | Lifetime       | Binding (`jti`)    | Used for                       |
//! |---------|----------------|--------------------|--------------------------------|
//! | access  | `access_time`  | none               | API requests                   |
//! | refresh | `refresh_time` | `session_id:key`   | exchange, refresh and logout   |
//! | session | `refresh_time` | `session_id`       | reusing the device on login    |
//!
//! Refreshing rotates the session key, so a refresh token works until the
//! first refresh that uses it.

use std::sync::Arc;

use chrono::Utc;
use warden_kvstore::KvStore;

use crate::{
    config::AuthConfig,
    error::{AuthError, Result},
    notify::{NewLogin, NewLoginNotifier},
    rank::{Rank, TAG_ADMIN, TAG_SYSTEM, TAG_USER, split_tag},
    role::{RoleCache, RoleRepository},
    session::{Session, SessionKey, SessionRepository, SessionStore},
    token::{Claims, Subject, TokenIssuer},
    user::{User, UserRepository, validate_password},
    validation::{session_binding, split_session_binding},
};

/// Tokens returned by the service.
///
/// Login fills every token, exchange only the access token, and refresh the
/// refresh and session tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    /// New access token.
    pub access_token: Option<String>,
    /// New refresh token.
    pub refresh_token: Option<String>,
    /// New session token.
    pub session_token: Option<String>,
    /// Claims of the token that authenticated the call.
    pub claims: Claims,
}

/// Login, token exchange, refresh, logout and account administration.
pub struct AuthService {
    config: AuthConfig,
    tokens: TokenIssuer,
    users: Arc<dyn UserRepository>,
    sessions: SessionStore,
    roles: RoleCache,
    notifier: Option<Arc<dyn NewLoginNotifier>>,
}

#[bon::bon]
impl AuthService {
    /// Creates a service signing tokens with `signing_key`, an Ed25519 key in
    /// PKCS#8 DER form.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Internal`] if the signing key is unusable.
    #[builder]
    pub fn new(
        #[builder(default)] config: AuthConfig,
        signing_key: &[u8],
        users: Arc<dyn UserRepository>,
        sessions: Arc<dyn SessionRepository>,
        roles: Arc<dyn RoleRepository>,
        kv: Arc<dyn KvStore>,
        notifier: Option<Arc<dyn NewLoginNotifier>>,
    ) -> Result<Self> {
        let tokens = TokenIssuer::new(config.issuer(), signing_key)
            .map_err(|e| AuthError::internal_with_source("invalid signing key", e))?;
        let sessions = SessionStore::new(
            sessions,
            Arc::clone(&kv),
            config.refresh_time(),
            config.refresh_cache_time(),
        );
        let roles = RoleCache::new(roles, kv, config.role_cache_time());
        Ok(Self { config, tokens, users, sessions, roles, notifier })
    }

    /// The service configuration.
    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// The token issuer, for verifying access tokens.
    #[must_use]
    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// The user repository.
    #[must_use]
    pub fn users(&self) -> &dyn UserRepository {
        self.users.as_ref()
    }

    /// The session store.
    #[must_use]
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The role cache.
    #[must_use]
    pub fn roles(&self) -> &RoleCache {
        &self.roles
    }

    /// Authenticates a user and issues all three tokens.
    ///
    /// `identifier` is an email address if it contains `@`, a username
    /// otherwise. A session token naming a live session of the same user
    /// reuses that session; any other session token is ignored and a new
    /// session is created.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for an unknown user or a wrong
    /// password, and repository or signing failures as internal errors.
    #[tracing::instrument(skip(self, password, session_token))]
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        session_token: Option<&str>,
        ip_addr: &str,
        user_agent: &str,
    ) -> Result<AuthTokens> {
        let user = self.find_user(identifier).await?;
        if !self.users.validate_pass(password, &user)? {
            return Err(AuthError::InvalidCredentials);
        }

        let existing = match session_token.and_then(|t| self.tokens.get_claims(t, Subject::Session))
        {
            Some(claims) if claims.userid == user.userid => {
                match self
                    .sessions
                    .from_session_id(&claims.id, &user.userid, ip_addr, user_agent)
                    .await
                {
                    Ok(session) => Some(session),
                    Err(err) if err.is_not_found() => None,
                    Err(err) => return Err(err),
                }
            },
            _ => None,
        };
        let is_new = existing.is_none();
        let (mut session, key) = match existing {
            Some(session) => (session, SessionKey::generate()),
            None => self.sessions.new_session(&user, ip_addr, user_agent),
        };

        let auth_tags = user.auth_tags.intersect(self.config.role_summary());
        let (access_token, claims) = self.tokens.generate(
            Subject::Access,
            &user.userid,
            &auth_tags,
            "",
            self.config.access_time(),
        )?;
        let (refresh_token, _) = self.tokens.generate(
            Subject::Refresh,
            &user.userid,
            &auth_tags,
            &session_binding(&session.session_id, key.as_str()),
            self.config.refresh_time(),
        )?;
        let (session_token, _) = self.tokens.generate(
            Subject::Session,
            &user.userid,
            &auth_tags,
            &session.session_id,
            self.config.refresh_time(),
        )?;

        if is_new {
            self.sessions.insert(&session, &key).await?;
            self.notify_new_login(&user, &session).await;
        } else {
            self.sessions.set_key(&mut session, &key).await?;
        }

        tracing::debug!(
            userid = %user.userid,
            session_id = %session.session_id,
            new_session = is_new,
            "Login succeeded"
        );
        Ok(AuthTokens {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            session_token: Some(session_token),
            claims,
        })
    }

    /// Trades a refresh token for a new access token.
    ///
    /// The session's authentication time, address and user agent are updated.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the refresh token is malformed,
    /// expired, rotated or names a deleted session.
    #[tracing::instrument(skip_all)]
    pub async fn exchange_token(
        &self,
        refresh_token: &str,
        ip_addr: &str,
        user_agent: &str,
    ) -> Result<AuthTokens> {
        let (session_id, binding) = self.live_binding(refresh_token).await?;
        let claims = self
            .tokens
            .validate(refresh_token, Subject::Refresh, &binding)
            .ok_or_else(|| AuthError::invalid_token("invalid refresh token"))?;

        let session = self
            .sessions
            .from_session_id(&session_id, &claims.userid, ip_addr, user_agent)
            .await
            .map_err(session_gone)?;
        self.sessions.update(&session).await?;

        let access_token = self.tokens.generate_from_claims(
            &claims,
            Subject::Access,
            "",
            self.config.access_time(),
        )?;
        Ok(AuthTokens {
            access_token: Some(access_token),
            refresh_token: None,
            session_token: None,
            claims,
        })
    }

    /// Rotates the session key and issues new refresh and session tokens.
    ///
    /// The presented refresh token stops working.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the refresh token is malformed,
    /// expired, already rotated or names a deleted session, and
    /// [`AuthError::Cache`] if the cached key cannot be cleared. Nothing is
    /// rotated on error.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<AuthTokens> {
        let (session_id, binding) = self.live_binding(refresh_token).await?;
        let claims = self
            .tokens
            .validate(refresh_token, Subject::Refresh, &binding)
            .ok_or_else(|| AuthError::invalid_token("invalid refresh token"))?;

        let key = SessionKey::generate();
        let new_refresh_token = self.tokens.generate_from_claims(
            &claims,
            Subject::Refresh,
            &session_binding(&session_id, key.as_str()),
            self.config.refresh_time(),
        )?;
        let session_token = self.tokens.generate_from_claims(
            &claims,
            Subject::Session,
            &session_id,
            self.config.refresh_time(),
        )?;

        let mut session = self.sessions.get(&session_id).await.map_err(session_gone)?;
        session.auth_time = Utc::now().timestamp();
        self.sessions.set_key(&mut session, &key).await?;

        Ok(AuthTokens {
            access_token: None,
            refresh_token: Some(new_refresh_token),
            session_token: Some(session_token),
            claims,
        })
    }

    /// Ends the session of a refresh token, even an expired one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] if the refresh token is malformed,
    /// rotated or names a deleted session.
    #[tracing::instrument(skip_all)]
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let (session_id, binding) = self.live_binding(refresh_token).await?;
        self.tokens
            .validate_skip_time(refresh_token, Subject::Refresh, &binding)
            .ok_or_else(|| AuthError::invalid_token("invalid refresh token"))?;

        self.sessions.delete(&[session_id]).await
    }

    /// Adds and removes rank tags of a user.
    ///
    /// Tags in both `add` and `remove` are removed. Every session of the user
    /// is ended so the new rank takes effect on the next login.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Forbidden`] or [`AuthError::BadRequest`] if the
    /// updater may not make the edit, and [`AuthError::NotFound`] for an
    /// unknown user.
    #[tracing::instrument(skip(self, updater_rank, add, remove), fields(add = %add, remove = %remove))]
    pub async fn update_rank(
        &self,
        userid: &str,
        updater_id: &str,
        updater_rank: &Rank,
        add: &Rank,
        remove: &Rank,
    ) -> Result<()> {
        can_update_rank(add, updater_rank, userid, updater_id)?;
        can_update_rank(remove, updater_rank, userid, updater_id)?;

        let mut user = self.users.get_by_id(userid).await?;

        let mut added = add.clone();
        added.remove(remove);

        if added.has(TAG_ADMIN) {
            tracing::info!(userid, username = %user.username, updater_id, "Admin status added");
        }
        if remove.has(TAG_ADMIN) {
            tracing::info!(userid, username = %user.username, updater_id, "Admin status removed");
        }

        if !remove.is_empty() {
            self.roles.delete_roles(userid, remove).await?;
        }
        if !added.is_empty() {
            self.roles.insert_roles(userid, &added).await?;
        }

        user.auth_tags.extend(&added);
        user.auth_tags.remove(remove);
        self.users.update(&user).await?;

        self.sessions.delete_all_for_user(userid).await?;
        Ok(())
    }

    /// Replaces a user's password after checking the old one.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if `old_password` is wrong and
    /// [`AuthError::BadRequest`] if `new_password` is too short.
    #[tracing::instrument(skip(self, new_password, old_password))]
    pub async fn update_password(
        &self,
        userid: &str,
        new_password: &str,
        old_password: &str,
    ) -> Result<()> {
        let mut user = self.users.get_by_id(userid).await?;
        if !self.users.validate_pass(old_password, &user)? {
            return Err(AuthError::InvalidCredentials);
        }
        validate_password(new_password)?;
        self.users.rehash_pass(&mut user, new_password)?;
        self.users.update(&user).await
    }

    /// Ends the given sessions of a user. Ids of other users' sessions are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    #[tracing::instrument(skip(self))]
    pub async fn kill_sessions(&self, userid: &str, session_ids: &[String]) -> Result<()> {
        let mut owned = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            if self.sessions.session_exists(userid, session_id).await? {
                owned.push(session_id.clone());
            }
        }
        self.sessions.delete(&owned).await
    }

    /// Ends every session of a user.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    #[tracing::instrument(skip(self))]
    pub async fn kill_all_sessions(&self, userid: &str) -> Result<()> {
        self.sessions.delete_all_for_user(userid).await.map(|_| ())
    }

    /// A page of a user's sessions, most recently used first.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn get_sessions(
        &self,
        userid: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Session>> {
        self.sessions.list(userid, limit, offset).await
    }

    /// The subset of `roles` the user holds.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn intersect_roles(&self, userid: &str, roles: &Rank) -> Result<Rank> {
        self.roles.intersect_roles(userid, roles).await
    }

    /// Every role the user holds, bounded.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn get_role_summary(&self, userid: &str) -> Result<Rank> {
        self.roles.get_role_summary(userid).await
    }

    async fn find_user(&self, identifier: &str) -> Result<User> {
        let found = if identifier.contains('@') {
            self.users.get_by_email(identifier).await
        } else {
            self.users.get_by_username(identifier).await
        };
        match found {
            Err(err) if err.is_not_found() => Err(AuthError::InvalidCredentials),
            other => other,
        }
    }

    /// Resolves the session a refresh token claims, returning the session id
    /// and the binding a valid token must carry.
    async fn live_binding(&self, refresh_token: &str) -> Result<(String, String)> {
        let claims = self
            .tokens
            .get_claims(refresh_token, Subject::Refresh)
            .ok_or_else(|| AuthError::invalid_token("malformed refresh token"))?;
        let (session_id, presented) = split_session_binding(&claims.id)
            .ok_or_else(|| AuthError::invalid_token("malformed refresh token"))?;
        let key = self
            .sessions
            .get_key(session_id, presented)
            .await?
            .ok_or_else(|| AuthError::invalid_token("session does not exist"))?;
        Ok((session_id.to_owned(), session_binding(session_id, key.as_str())))
    }

    async fn notify_new_login(&self, user: &User, session: &Session) {
        if !self.config.new_login_notify() {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };
        let login = NewLogin {
            userid: user.userid.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
            session_id: session.session_id.clone(),
            ip_addr: session.ip_addr.clone(),
            user_agent: session.user_agent.clone(),
            login_time: Utc::now().timestamp(),
        };
        if let Err(err) = notifier.notify(&login).await {
            tracing::error!(
                actiontype = "newloginnotify",
                userid = %user.userid,
                error = %err,
                "Failed to send new login notification"
            );
        }
    }
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("config", &self.config)
            .field("tokens", &self.tokens)
            .field("sessions", &self.sessions)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

/// Checks that `updater` may add or remove every tag of `edit` on `target`.
///
/// # Errors
///
/// - `admin`: [`AuthError::Forbidden`] unless the updater is an admin other
///   than the target.
/// - `system`: always [`AuthError::Forbidden`].
/// - `user`: [`AuthError::Forbidden`] unless the updater is an admin.
/// - `mod.`, `usr.` and `ban.` tags: [`AuthError::Forbidden`] unless the
///   updater is an admin or a moderator of the group.
/// - anything else: [`AuthError::BadRequest`].
pub fn can_update_rank(edit: &Rank, updater: &Rank, target_id: &str, updater_id: &str) -> Result<()> {
    let is_admin = updater.has(TAG_ADMIN);
    for tag in edit {
        match tag.as_str() {
            TAG_ADMIN => {
                if target_id == updater_id || !is_admin {
                    return Err(AuthError::forbidden("forbidden rank edit"));
                }
            },
            TAG_SYSTEM => return Err(AuthError::forbidden("forbidden rank edit")),
            TAG_USER => {
                if !is_admin {
                    return Err(AuthError::forbidden("forbidden rank edit"));
                }
            },
            _ => {
                let (_, group) =
                    split_tag(tag).map_err(|_| AuthError::bad_request("forbidden rank edit"))?;
                if !is_admin && !updater.has_mod(group) {
                    return Err(AuthError::forbidden("forbidden rank edit"));
                }
            },
        }
    }
    Ok(())
}

fn session_gone(err: AuthError) -> AuthError {
    if err.is_not_found() { AuthError::invalid_token("session does not exist") } else { err }
}
