//! REST surface: login/logout, password change, session listing, account
//! deactivation, and notification broadcast.
//!
//! Everything except `/auth/login` and `/health` sits behind
//! [`require_auth`], which validates the bearer token through the session
//! authority (the same two-layer check the realtime gate uses) and puts
//! the resulting [`Principal`] into the request extensions.

use std::sync::Arc;

use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, USER_AGENT};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use vigil_hub::{HubError, HubHandle};
use vigil_protocol::{Message, Notification};
use vigil_session::{AuthError, ClientInfo, Principal, Session};

use crate::accounts::{AccountError, UserProfile};
use crate::server::Accounts;

/// Shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<Accounts>,
    pub hub: HubHandle,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/password", post(change_password))
        .route("/auth/sessions", get(list_sessions))
        .route("/users/{username}/disable", post(disable_user))
        .route("/users/{username}/enable", post(enable_user))
        .route("/notifications", post(send_notification))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/auth/login", post(login))
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("administrator privileges required")]
    Forbidden,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::Auth(e) | Self::Account(AccountError::Auth(e)) => auth_status(e),
            Self::Account(AccountError::UnknownUser(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::Account(AccountError::UsernameTaken(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            Self::Account(AccountError::WeakPassword) => (StatusCode::BAD_REQUEST, "WEAK_PASSWORD"),
            Self::Account(AccountError::Hashing(_) | AccountError::Directory(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            Self::Hub(_) => (StatusCode::SERVICE_UNAVAILABLE, "HUB_UNAVAILABLE"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        };

        let error = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(ErrorBody {
            error,
            code: code.to_string(),
        });
        (status, body).into_response()
    }
}

fn auth_status(error: &AuthError) -> (StatusCode, &'static str) {
    let status = match error {
        AuthError::AccountDisabled => StatusCode::FORBIDDEN,
        AuthError::Signing(_) | AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNAUTHORIZED,
    };
    (status, error.code())
}

// ---------------------------------------------------------------------------
// Authentication middleware
// ---------------------------------------------------------------------------

/// Validates `Authorization: Bearer <token>` and inserts the [`Principal`].
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = {
        let token = bearer_token(request.headers()).ok_or(AuthError::NotFound)?;
        state.accounts.authority().validate_token(token)?
    };
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then_some(token)
}

fn require_admin(state: &AppState, principal: &Principal) -> Result<UserProfile, ApiError> {
    let profile = state.accounts.profile(principal.user_id)?;
    if profile.is_admin {
        Ok(profile)
    } else {
        Err(ApiError::Forbidden)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserProfile,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let client = ClientInfo {
        ip: header_str(&headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string()),
        user_agent: header_str(&headers, USER_AGENT.as_str()).map(str::to_string),
    };
    let outcome = state
        .accounts
        .login(&body.username, &body.password, client)
        .await?;
    Ok(Json(LoginResponse {
        token: outcome.session.token,
        expires_at: outcome.session.expires_at,
        user: outcome.user,
    }))
}

async fn logout(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = state.accounts.logout(&principal).await?;
    Ok(Json(json!({ "revoked": revoked })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let revoked = state
        .accounts
        .change_password(principal.user_id, &body.current_password, &body.new_password)
        .await?;
    Ok(Json(json!({ "revoked_sessions": revoked })))
}

#[derive(Debug, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    /// Whether this is the session making the request.
    pub current: bool,
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let sessions = state
        .accounts
        .authority()
        .sessions_for_user(principal.user_id)?
        .into_iter()
        .map(|session| SessionSummary {
            current: session.id == principal.session_id,
            session,
        })
        .collect();
    Ok(Json(sessions))
}

async fn disable_user(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_active(state, principal, username, false).await
}

async fn enable_user(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    set_active(state, principal, username, true).await
}

async fn set_active(
    state: AppState,
    principal: Principal,
    username: String,
    active: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let admin = require_admin(&state, &principal)?;
    let revoked = state.accounts.set_active(&username, active).await?;
    tracing::info!(admin = %admin.username, %username, active, revoked, "account status set");
    Ok(Json(json!({ "username": username, "active": active, "revoked_sessions": revoked })))
}

async fn send_notification(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(notification): Json<Notification>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let admin = require_admin(&state, &principal)?;
    let message = Message::notification(&notification).with_user(admin.id, admin.username);
    let report = state.hub.broadcast(&message).await?;
    Ok(Json(json!({ "delivered": report.delivered, "evicted": report.evicted })))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.hub.connection_count().await {
        Ok(connections) => Json(json!({ "status": "ok", "connections": connections })).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}
