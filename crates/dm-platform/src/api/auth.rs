//! Authentication API
//!
//! Registration, login with the optional MFA step, token refresh, logout
//! and self-service MFA management.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::api::common::{client_info, SuccessResponse};
use crate::api::middleware::{Authenticated, OptionalAuth};
use crate::api::users::UserResponse;
use crate::error::{DotMacError, Result};
use crate::events::ExecutionContext;
use crate::repository::UserRepository;
use crate::service::{AuthService, LoginOutcome, MfaSetup, RegisterInput, TokenPair};

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub tenant_id: Uuid,
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub tenant_id: Uuid,
    /// Username or email address
    #[serde(alias = "username", alias = "email")]
    pub username_or_email: String,
    pub password: String,
}

/// Either tokens, or a challenge to complete with `/mfa/verify`
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub mfa_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenPair>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_expires_in: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaVerifyRequest {
    pub challenge_token: String,
    /// TOTP code or backup code
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaCodeRequest {
    pub code: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaDisableRequest {
    pub password: String,
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupCodesResponse {
    /// Shown once; store them somewhere safe
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogoutAllResponse {
    pub sessions_ended: usize,
}

/// Current user with resolved access
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub user: UserResponse,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub denied_permissions: Vec<String>,
    pub session_id: String,
}

/// Auth service state
#[derive(Clone)]
pub struct AuthApiState {
    pub auth: Arc<AuthService>,
    pub users: Arc<dyn UserRepository>,
}

/// Register a new user
#[utoipa::path(
    post,
    path = "/api/v1/auth/register",
    tag = "auth",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = UserResponse),
        (status = 400, description = "Validation error"),
        (status = 409, description = "Username or email taken")
    )
)]
pub async fn register(
    State(state): State<AuthApiState>,
    caller: OptionalAuth,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    let ctx = caller
        .0
        .map(|a| a.execution_context())
        .unwrap_or_else(ExecutionContext::system);
    let user = state
        .auth
        .register(
            &ctx,
            RegisterInput {
                tenant_id: req.tenant_id,
                username: req.username,
                email: req.email,
                password: req.password,
                full_name: req.full_name,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Log in with username or email and password
#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Tokens issued or MFA challenge", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 423, description = "Account locked")
    )
)]
pub async fn login(
    State(state): State<AuthApiState>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let outcome = state
        .auth
        .login(req.tenant_id, &req.username_or_email, &req.password, client_info(&headers))
        .await?;

    Ok(Json(match outcome {
        LoginOutcome::Authenticated { user, tokens } => LoginResponse {
            mfa_required: false,
            tokens: Some(tokens),
            user: Some(user.into()),
            challenge_token: None,
            challenge_expires_in: None,
        },
        LoginOutcome::MfaRequired { challenge_token, expires_in } => LoginResponse {
            mfa_required: true,
            tokens: None,
            user: None,
            challenge_token: Some(challenge_token),
            challenge_expires_in: Some(expires_in),
        },
    }))
}

/// Complete an MFA login
#[utoipa::path(
    post,
    path = "/api/v1/auth/mfa/verify",
    tag = "auth",
    request_body = MfaVerifyRequest,
    responses(
        (status = 200, description = "Tokens issued", body = LoginResponse),
        (status = 401, description = "Invalid code or challenge")
    )
)]
pub async fn verify_mfa(
    State(state): State<AuthApiState>,
    headers: HeaderMap,
    Json(req): Json<MfaVerifyRequest>,
) -> Result<Json<LoginResponse>> {
    let (user, tokens) = state
        .auth
        .complete_mfa_login(&req.challenge_token, &req.code, client_info(&headers))
        .await?;
    Ok(Json(LoginResponse {
        mfa_required: false,
        tokens: Some(tokens),
        user: Some(user.into()),
        challenge_token: None,
        challenge_expires_in: None,
    }))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/api/v1/auth/refresh",
    tag = "auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Refresh token invalid, expired or reused")
    )
)]
pub async fn refresh(
    State(state): State<AuthApiState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    Ok(Json(state.auth.refresh(&req.refresh_token).await?))
}

/// End the current session
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout",
    tag = "auth",
    responses((status = 200, description = "Logged out", body = SuccessResponse)),
    security(("bearer_auth" = []))
)]
pub async fn logout(State(state): State<AuthApiState>, auth: Authenticated) -> Result<Json<SuccessResponse>> {
    state.auth.logout(&auth.0).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// End every session of the current user
#[utoipa::path(
    post,
    path = "/api/v1/auth/logout-all",
    tag = "auth",
    responses((status = 200, description = "All sessions ended", body = LogoutAllResponse)),
    security(("bearer_auth" = []))
)]
pub async fn logout_all(
    State(state): State<AuthApiState>,
    auth: Authenticated,
) -> Result<Json<LogoutAllResponse>> {
    let sessions_ended = state.auth.logout_all(&auth.0).await?;
    Ok(Json(LogoutAllResponse { sessions_ended }))
}

/// Current user profile and effective permissions
#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    tag = "auth",
    responses((status = 200, description = "Current user", body = MeResponse)),
    security(("bearer_auth" = []))
)]
pub async fn me(State(state): State<AuthApiState>, auth: Authenticated) -> Result<Json<MeResponse>> {
    let auth = auth.0;
    let user = state
        .users
        .find_by_id(auth.user_id)
        .await?
        .ok_or_else(|| DotMacError::not_found("User", auth.user_id))?;

    Ok(Json(MeResponse {
        user: user.into(),
        roles: auth.permissions.roles.clone(),
        permissions: auth.permissions.granted.iter().cloned().collect(),
        denied_permissions: auth.permissions.denied.iter().cloned().collect(),
        session_id: auth.session_id,
    }))
}

/// Start MFA enrolment
#[utoipa::path(
    post,
    path = "/api/v1/auth/mfa/setup",
    tag = "auth",
    responses(
        (status = 200, description = "Secret and provisioning URI", body = MfaSetup),
        (status = 409, description = "MFA already enabled")
    ),
    security(("bearer_auth" = []))
)]
pub async fn setup_mfa(State(state): State<AuthApiState>, auth: Authenticated) -> Result<Json<MfaSetup>> {
    Ok(Json(state.auth.setup_mfa(auth.0.user_id).await?))
}

/// Confirm enrolment with a code from the authenticator
#[utoipa::path(
    post,
    path = "/api/v1/auth/mfa/confirm",
    tag = "auth",
    request_body = MfaCodeRequest,
    responses(
        (status = 200, description = "MFA enabled", body = BackupCodesResponse),
        (status = 401, description = "Invalid code")
    ),
    security(("bearer_auth" = []))
)]
pub async fn confirm_mfa(
    State(state): State<AuthApiState>,
    auth: Authenticated,
    Json(req): Json<MfaCodeRequest>,
) -> Result<Json<BackupCodesResponse>> {
    let backup_codes = state
        .auth
        .confirm_mfa(&auth.0.execution_context(), auth.0.user_id, &req.code)
        .await?;
    Ok(Json(BackupCodesResponse { backup_codes }))
}

/// Turn MFA off
#[utoipa::path(
    post,
    path = "/api/v1/auth/mfa/disable",
    tag = "auth",
    request_body = MfaDisableRequest,
    responses(
        (status = 200, description = "MFA disabled", body = SuccessResponse),
        (status = 401, description = "Invalid password or code")
    ),
    security(("bearer_auth" = []))
)]
pub async fn disable_mfa(
    State(state): State<AuthApiState>,
    auth: Authenticated,
    Json(req): Json<MfaDisableRequest>,
) -> Result<Json<SuccessResponse>> {
    state
        .auth
        .disable_mfa(&auth.0.execution_context(), auth.0.user_id, &req.password, &req.code)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

/// Replace all backup codes
#[utoipa::path(
    post,
    path = "/api/v1/auth/mfa/backup-codes",
    tag = "auth",
    request_body = MfaCodeRequest,
    responses((status = 200, description = "New backup codes", body = BackupCodesResponse)),
    security(("bearer_auth" = []))
)]
pub async fn regenerate_backup_codes(
    State(state): State<AuthApiState>,
    auth: Authenticated,
    Json(req): Json<MfaCodeRequest>,
) -> Result<Json<BackupCodesResponse>> {
    let backup_codes = state
        .auth
        .regenerate_backup_codes(auth.0.user_id, &req.code)
        .await?;
    Ok(Json(BackupCodesResponse { backup_codes }))
}

/// Create auth router
pub fn auth_router(state: AuthApiState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/mfa/verify", post(verify_mfa))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/logout-all", post(logout_all))
        .route("/me", get(me))
        .route("/mfa/setup", post(setup_mfa))
        .route("/mfa/confirm", post(confirm_mfa))
        .route("/mfa/disable", post(disable_mfa))
        .route("/mfa/backup-codes", post(regenerate_backup_codes))
        .with_state(state)
}
