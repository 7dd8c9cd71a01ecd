//! REST surface tests, driven in-process through `tower::ServiceExt`.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;
use vigil::accounts::{AccountService, MemoryUserDirectory, PasswordHashing};
use vigil::api::{self, AppState};
use vigil::server::{Accounts, Authority};
use vigil_hub::{HubConfig, HubHandle};
use vigil_session::{SessionAuthority, SessionConfig};

// =========================================================================
// Helpers
// =========================================================================

struct TestApp {
    router: Router,
    accounts: Arc<Accounts>,
    hub: HubHandle,
}

async fn test_app() -> TestApp {
    let (hub, _task) = HubHandle::spawn(HubConfig::default());
    let authority: Arc<Authority> = Arc::new(
        SessionAuthority::new(b"api-test-secret", SessionConfig::default())
            .with_listener(hub.clone()),
    );
    let accounts = Arc::new(
        AccountService::new(MemoryUserDirectory::new(), authority)
            .with_hashing(PasswordHashing::with_cost(8, 1).unwrap()),
    );
    accounts
        .create_user("alice", "alice-password", true)
        .await
        .unwrap();
    accounts.create_user("bob", "bob-password", false).await.unwrap();

    let router = api::router(AppState {
        accounts: Arc::clone(&accounts),
        hub: hub.clone(),
    });
    TestApp {
        router,
        accounts,
        hub,
    }
}

impl TestApp {
    async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn login(&self, username: &str, password: &str) -> String {
        let (status, body) = self
            .call(
                "POST",
                "/auth/login",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body["token"].as_str().unwrap().to_string()
    }
}

// =========================================================================
// Login / logout
// =========================================================================

#[tokio::test]
async fn test_login_returns_token_and_profile() {
    let app = test_app().await;
    let (status, body) = app
        .call(
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "alice-password" })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["token"].as_str().is_some_and(|t| t.split('.').count() == 3));
    assert!(body["expires_at"].is_string());
    assert_eq!(body["user"]["username"], "alice");
    assert_eq!(body["user"]["is_admin"], true);
    assert!(body["user"].get("password_hash").is_none());
}

#[tokio::test]
async fn test_login_wrong_password_and_unknown_user_look_the_same() {
    let app = test_app().await;
    let (wrong_status, wrong_body) = app
        .call(
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "alice", "password": "nope-nope" })),
        )
        .await;
    let (unknown_status, unknown_body) = app
        .call(
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "mallory", "password": "nope-nope" })),
        )
        .await;

    assert_eq!(wrong_status, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_status, StatusCode::UNAUTHORIZED);
    assert_eq!(wrong_body, unknown_body);
    assert_eq!(wrong_body["code"], "INVALID_CREDENTIALS");
}

#[tokio::test]
async fn test_logout_revokes_the_presented_token() {
    let app = test_app().await;
    let token = app.login("bob", "bob-password").await;

    let (status, body) = app.call("POST", "/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], true);

    let (status, body) = app.call("GET", "/auth/sessions", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SESSION_REVOKED");
}

// =========================================================================
// Authentication middleware
// =========================================================================

#[tokio::test]
async fn test_protected_route_without_token_is_401() {
    let app = test_app().await;
    let (status, body) = app.call("GET", "/auth/sessions", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_protected_route_with_garbage_token_is_401() {
    let app = test_app().await;
    let (status, body) = app
        .call("GET", "/auth/sessions", Some("definitely.not.valid"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "TOKEN_MALFORMED");
}

#[tokio::test]
async fn test_sessions_lists_every_login_and_marks_current() {
    let app = test_app().await;
    let first = app.login("bob", "bob-password").await;
    let _second = app.login("bob", "bob-password").await;

    let (status, body) = app.call("GET", "/auth/sessions", Some(&first), None).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = body.as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions.iter().filter(|s| s["current"] == true).count(), 1);
    assert!(sessions.iter().all(|s| s["username"] == "bob"));
    assert!(sessions.iter().all(|s| s.get("token_hash").is_none()));
}

// =========================================================================
// Password change
// =========================================================================

#[tokio::test]
async fn test_change_password_revokes_every_session() {
    let app = test_app().await;
    let token = app.login("bob", "bob-password").await;
    let other = app.login("bob", "bob-password").await;

    let (status, body) = app
        .call(
            "POST",
            "/auth/password",
            Some(&token),
            Some(json!({ "current_password": "bob-password", "new_password": "fresh-password" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked_sessions"], 2);

    for stale in [&token, &other] {
        let (status, _) = app.call("GET", "/auth/sessions", Some(stale), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    app.login("bob", "fresh-password").await;
}

#[tokio::test]
async fn test_change_password_rejects_weak_replacement() {
    let app = test_app().await;
    let token = app.login("bob", "bob-password").await;

    let (status, body) = app
        .call(
            "POST",
            "/auth/password",
            Some(&token),
            Some(json!({ "current_password": "bob-password", "new_password": "short" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "WEAK_PASSWORD");

    // Nothing was revoked.
    let (status, _) = app.call("GET", "/auth/sessions", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
}

// =========================================================================
// Admin operations
// =========================================================================

#[tokio::test]
async fn test_disable_user_requires_admin() {
    let app = test_app().await;
    let token = app.login("bob", "bob-password").await;
    let (status, body) = app
        .call("POST", "/users/alice/disable", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_disable_user_revokes_sessions_and_blocks_login() {
    let app = test_app().await;
    let admin = app.login("alice", "alice-password").await;
    let bob = app.login("bob", "bob-password").await;

    let (status, body) = app
        .call("POST", "/users/bob/disable", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);
    assert_eq!(body["revoked_sessions"], 1);

    let (status, _) = app.call("GET", "/auth/sessions", Some(&bob), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .call(
            "POST",
            "/auth/login",
            None,
            Some(json!({ "username": "bob", "password": "bob-password" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "ACCOUNT_DISABLED");

    let (status, _) = app
        .call("POST", "/users/bob/enable", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    app.login("bob", "bob-password").await;
}

#[tokio::test]
async fn test_disable_unknown_user_is_404() {
    let app = test_app().await;
    let admin = app.login("alice", "alice-password").await;
    let (status, body) = app
        .call("POST", "/users/nobody/disable", Some(&admin), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_notification_is_broadcast_with_admin_attribution() {
    let app = test_app().await;
    let admin = app.login("alice", "alice-password").await;

    let (status, body) = app
        .call(
            "POST",
            "/notifications",
            Some(&admin),
            Some(json!({ "title": "Deploy", "message": "rolling out", "level": "warning" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivered"], 0);
    assert_eq!(body["evicted"], 0);

    let bob = app.login("bob", "bob-password").await;
    let (status, _) = app
        .call(
            "POST",
            "/notifications",
            Some(&bob),
            Some(json!({ "title": "x", "message": "y" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// =========================================================================
// Health
// =========================================================================

#[tokio::test]
async fn test_health_reports_connection_count() {
    let app = test_app().await;
    let (status, body) = app.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn test_health_after_hub_shutdown_is_503() {
    let app = test_app().await;
    app.hub.shutdown().await.unwrap();
    let (status, body) = app.call("GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "HUB_UNAVAILABLE");
    assert_eq!(body["error"], "internal server error");
    // Accounts are unaffected by the hub going away.
    let outcome = app
        .accounts
        .login("bob", "bob-password", Default::default())
        .await
        .unwrap();
    assert_eq!(outcome.user.username, "bob");
}
