//! First-run setup.
//!
//! Setup creates the first administrator. It may run once per deployment:
//! the "already run" flag is persisted through a [`SetupRepository`] and
//! loaded into a [`SetupGuard`] owned by the composition root, which
//! serializes concurrent attempts.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    error::{AuthError, Result},
    rank::Rank,
    service::AuthService,
    user::{User, validate_email, validate_password, validate_username},
};

/// The first administrator and the organization they set up.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupRequest {
    /// Administrator username.
    pub username: String,
    /// Administrator password.
    pub password: String,
    /// Administrator email.
    pub email: String,
    /// Administrator given name.
    #[serde(default)]
    pub first_name: String,
    /// Administrator family name.
    #[serde(default)]
    pub last_name: String,
    /// Organization name.
    pub orgname: String,
}

impl SetupRequest {
    /// Checks the request shape.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::BadRequest`] for a username under 3 characters, a
    /// password under 10 characters, a malformed email or a missing
    /// organization name.
    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        validate_password(&self.password)?;
        validate_email(&self.email)?;
        if self.orgname.is_empty() {
            return Err(AuthError::bad_request("organization name must be provided"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SetupRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupRequest")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("orgname", &self.orgname)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupResponse {
    /// The administrator's id.
    pub userid: String,
    /// The administrator's username.
    pub username: String,
    /// The administrator's given name.
    pub first_name: String,
    /// The administrator's family name.
    pub last_name: String,
    /// Organization name.
    pub orgname: String,
}

/// Durable storage of the setup flag.
#[async_trait]
pub trait SetupRepository: Send + Sync {
    /// Returns `true` if setup has completed.
    async fn load(&self) -> Result<bool>;

    /// Records that setup has completed.
    async fn store(&self) -> Result<()>;
}

/// In-memory [`SetupRepository`].
#[derive(Debug, Default)]
pub struct MemorySetupRepository {
    done: parking_lot::Mutex<bool>,
}

impl MemorySetupRepository {
    /// A repository in the not-yet-run state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository in the given state.
    #[must_use]
    pub fn with_done(done: bool) -> Self {
        Self { done: parking_lot::Mutex::new(done) }
    }
}

#[async_trait]
impl SetupRepository for MemorySetupRepository {
    async fn load(&self) -> Result<bool> {
        Ok(*self.done.lock())
    }

    async fn store(&self) -> Result<()> {
        *self.done.lock() = true;
        Ok(())
    }
}

/// Runs setup at most once.
pub struct SetupGuard {
    repo: Arc<dyn SetupRepository>,
    done: Mutex<bool>,
}

impl SetupGuard {
    /// Loads the persisted flag.
    ///
    /// # Errors
    ///
    /// Returns repository failures.
    pub async fn load(repo: Arc<dyn SetupRepository>) -> Result<Self> {
        let done = repo.load().await?;
        Ok(Self { repo, done: Mutex::new(done) })
    }

    /// Returns `true` if setup has completed.
    pub async fn is_done(&self) -> bool {
        *self.done.lock().await
    }

    /// Creates the first administrator with the `user` and `admin` roles.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Conflict`] if setup already ran,
    /// [`AuthError::BadRequest`] for an invalid request, and repository
    /// failures otherwise.
    #[tracing::instrument(skip_all, fields(username = %request.username, orgname = %request.orgname))]
    pub async fn setup(&self, request: &SetupRequest, auth: &AuthService) -> Result<SetupResponse> {
        let mut done = self.done.lock().await;
        if *done {
            return Err(AuthError::conflict("setup already run"));
        }
        request.validate()?;

        let mut admin = User::new(
            request.username.as_str(),
            &request.password,
            request.email.as_str(),
            request.first_name.as_str(),
            request.last_name.as_str(),
        )?;
        admin.auth_tags = Rank::admin();

        auth.users().insert(&admin).await?;
        auth.roles().insert_roles(&admin.userid, &admin.auth_tags).await?;
        self.repo.store().await?;
        *done = true;

        tracing::info!(userid = %admin.userid, "Setup complete");
        Ok(SetupResponse {
            userid: admin.userid,
            username: admin.username,
            first_name: admin.first_name,
            last_name: admin.last_name,
            orgname: request.orgname.clone(),
        })
    }
}

impl std::fmt::Debug for SetupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupGuard").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{assert_auth_error, testutil::TestEnv, user::UserRepository};

    fn request() -> SetupRequest {
        SetupRequest {
            username: "admin".into(),
            password: "admin password".into(),
            email: "admin@example.com".into(),
            first_name: "Ada".into(),
            last_name: "Min".into(),
            orgname: "Example".into(),
        }
    }

    #[rstest]
    #[case(|r: &mut SetupRequest| r.username = "ad".into())]
    #[case(|r: &mut SetupRequest| r.password = "short".into())]
    #[case(|r: &mut SetupRequest| r.email = "not-an-email".into())]
    #[case(|r: &mut SetupRequest| r.orgname = String::new())]
    fn test_validate_rejects(#[case] edit: fn(&mut SetupRequest)) {
        let mut req = request();
        edit(&mut req);
        assert_auth_error!(req.validate(), BadRequest);
    }

    #[test]
    fn test_request_debug_hides_password() {
        assert!(!format!("{:?}", request()).contains("admin password"));
    }

    #[tokio::test]
    async fn test_setup_creates_admin_once() {
        let env = TestEnv::new();
        let repo = Arc::new(MemorySetupRepository::new());
        let guard = SetupGuard::load(repo.clone()).await.unwrap();
        assert!(!guard.is_done().await);

        let res = guard.setup(&request(), &env.service).await.unwrap();
        assert_eq!(res.username, "admin");
        assert_eq!(res.orgname, "Example");
        assert!(guard.is_done().await);
        assert!(repo.load().await.unwrap());

        let admin = env.users.get_by_id(&res.userid).await.unwrap();
        assert_eq!(admin.auth_tags, Rank::admin());
        assert_eq!(
            env.service.get_role_summary(&res.userid).await.unwrap(),
            Rank::admin()
        );

        assert_auth_error!(guard.setup(&request(), &env.service).await, Conflict);
        assert_eq!(env.users.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_flag_survives_reload() {
        let env = TestEnv::new();
        let repo = Arc::new(MemorySetupRepository::with_done(true));
        let guard = SetupGuard::load(repo).await.unwrap();

        assert_auth_error!(guard.setup(&request(), &env.service).await, Conflict);
        assert!(env.users.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_setup_open() {
        let env = TestEnv::new();
        let guard = SetupGuard::load(Arc::new(MemorySetupRepository::new())).await.unwrap();
        let mut bad = request();
        bad.password = "short".into();

        assert_auth_error!(guard.setup(&bad, &env.service).await, BadRequest);
        assert!(!guard.is_done().await);
        assert!(guard.setup(&request(), &env.service).await.is_ok());
    }

    #[tokio::test]
    async fn test_admin_can_log_in_after_setup() {
        let env = TestEnv::new();
        let guard = SetupGuard::load(Arc::new(MemorySetupRepository::new())).await.unwrap();
        guard.setup(&request(), &env.service).await.unwrap();

        let tokens =
            env.service.login("admin", "admin password", None, "ip", "ua").await.unwrap();
        assert_eq!(tokens.claims.auth_tags, Rank::admin());
    }
}
