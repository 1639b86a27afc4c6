#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection in the authn crate.
//!
//! These tests require both `failpoints` and `testutil` features:
//! ```bash
//! cargo test -p warden-authn --features failpoints,testutil --test failpoint_tests
//! ```

use warden_authn::{AuthError, Rank, RoleRepository, testutil::TestEnv};

async fn login(env: &TestEnv) -> String {
    env.add_user("alice", "password123").await;
    env.service
        .login("alice", "password123", None, "ip", "ua")
        .await
        .expect("login")
        .refresh_token
        .expect("refresh token")
}

#[tokio::test]
async fn failed_rotation_keeps_the_old_refresh_token() {
    let scenario = fail::FailScenario::setup();
    let env = TestEnv::new();
    let refresh = login(&env).await;

    fail::cfg("session-before-set-key", "return").expect("failed to configure fail point");
    let err = env.service.refresh_token(&refresh).await.expect_err("rotation must fail");
    assert!(matches!(err, AuthError::Repository { .. }));
    assert_eq!(err.status(), 500);

    fail::remove("session-before-set-key");
    env.service.exchange_token(&refresh, "ip", "ua").await.expect("old token still valid");
    env.service.refresh_token(&refresh).await.expect("rotation succeeds once healthy");

    scenario.teardown();
}

#[tokio::test]
async fn login_fails_when_reused_session_cannot_be_saved() {
    let scenario = fail::FailScenario::setup();
    let env = TestEnv::new();
    env.add_user("alice", "password123").await;
    let first =
        env.service.login("alice", "password123", None, "ip", "ua").await.expect("first login");

    fail::cfg("session-before-set-key", "return").expect("failed to configure fail point");
    let result = env
        .service
        .login("alice", "password123", first.session_token.as_deref(), "ip", "ua")
        .await;
    assert!(matches!(result, Err(AuthError::Repository { .. })));

    fail::remove("session-before-set-key");
    let refresh = first.refresh_token.expect("refresh token");
    env.service.exchange_token(&refresh, "ip", "ua").await.expect("first session intact");

    scenario.teardown();
}

#[tokio::test]
async fn batch_failure_falls_back_to_repository() {
    let scenario = fail::FailScenario::setup();
    let env = TestEnv::new();
    let roles = Rank::parse("admin,user").expect("rank");
    env.role_repo.insert_roles("u1", &Rank::admin()).await.expect("seed roles");

    fail::cfg("kv-exec", "return").expect("failed to configure fail point");
    env.role_repo.reset_calls();
    for _ in 0..2 {
        let held = env.service.intersect_roles("u1", &roles).await.expect("fallback");
        assert_eq!(held, Rank::admin());
    }
    assert_eq!(env.role_repo.calls(), 2, "nothing is cached while batches fail");

    fail::remove("kv-exec");
    env.service.intersect_roles("u1", &roles).await.expect("warm");
    env.role_repo.reset_calls();
    env.service.intersect_roles("u1", &roles).await.expect("cached");
    assert_eq!(env.role_repo.calls(), 0);

    scenario.teardown();
}

#[tokio::test]
async fn refresh_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    let env = TestEnv::new();
    let refresh = login(&env).await;

    env.service.refresh_token(&refresh).await.expect("refresh should succeed without fail point");

    scenario.teardown();
}
