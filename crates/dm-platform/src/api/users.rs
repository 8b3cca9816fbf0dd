//! Users Admin API
//!
//! Tenant-scoped user management. Callers only see users of their own
//! tenant unless they hold the `*` permission.

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::common::{PaginatedResponse, PaginationParams, SuccessResponse};
use crate::api::middleware::Authenticated;
use crate::domain::{catalogue, validate_email, User};
use crate::error::{DotMacError, Result};
use crate::repository::UserRepository;
use crate::service::{AuthContext, AuthService, RbacService};

/// User response DTO
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub is_verified: bool,
    pub mfa_enabled: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<User> for UserResponse {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            tenant_id: u.tenant_id,
            username: u.username,
            email: u.email,
            full_name: u.full_name,
            is_active: u.is_active,
            is_verified: u.is_verified,
            mfa_enabled: u.mfa_enabled,
            last_login_at: u.last_login_at.map(|t| t.to_rfc3339()),
            created_at: u.created_at.to_rfc3339(),
            updated_at: u.updated_at.to_rfc3339(),
        }
    }
}

/// Update user request; absent fields are left unchanged
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    /// Only settable with `users:write`
    pub is_verified: Option<bool>,
}

/// Query parameters for the users list
#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct UsersQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Another tenant's users; superusers only
    pub tenant_id: Option<Uuid>,
}

fn default_page() -> u32 { 1 }
fn default_limit() -> u32 { 20 }

/// Users service state
#[derive(Clone)]
pub struct UsersState {
    pub users: Arc<dyn UserRepository>,
    pub rbac: Arc<RbacService>,
    pub auth: Arc<AuthService>,
}

impl UsersState {
    /// Load a user the caller is allowed to see
    async fn load_visible(&self, auth: &AuthContext, id: Uuid) -> Result<User> {
        let user = self
            .users
            .find_by_id(id)
            .await?
            .ok_or_else(|| DotMacError::not_found("User", id))?;
        auth.ensure_tenant(user.tenant_id)?;
        Ok(user)
    }
}

/// Reading yourself needs only `users:read_self`
fn require_read(auth: &AuthContext, id: Uuid) -> Result<()> {
    if auth.user_id == id {
        auth.require_any(&[catalogue::USERS_READ, catalogue::USERS_READ_SELF])
    } else {
        auth.require(catalogue::USERS_READ)
    }
}

/// List users of a tenant
#[utoipa::path(
    get,
    path = "/api/v1/users",
    tag = "users",
    params(UsersQuery),
    responses(
        (status = 200, description = "Users of the tenant", body = PaginatedResponse<UserResponse>),
        (status = 403, description = "Missing users:read or foreign tenant")
    ),
    security(("bearer_auth" = []))
)]
pub async fn list_users(
    State(state): State<UsersState>,
    auth: Authenticated,
    Query(query): Query<UsersQuery>,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    auth.0.require(catalogue::USERS_READ)?;
    let tenant_id = query.tenant_id.unwrap_or(auth.0.tenant_id);
    auth.0.ensure_tenant(tenant_id)?;

    let pagination = PaginationParams { page: query.page, limit: query.limit };
    let (users, total) = state
        .users
        .list(tenant_id, pagination.offset() as i64, pagination.limit() as i64)
        .await?;

    Ok(Json(PaginatedResponse::new(
        users.into_iter().map(UserResponse::from).collect(),
        pagination.page(),
        pagination.limit(),
        total.max(0) as u64,
    )))
}

/// Get a user
#[utoipa::path(
    get,
    path = "/api/v1/users/{id}",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User found", body = UserResponse),
        (status = 404, description = "User not found")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_user(
    State(state): State<UsersState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>> {
    require_read(&auth.0, id)?;
    let user = state.load_visible(&auth.0, id).await?;
    Ok(Json(user.into()))
}

/// Update a user's profile
#[utoipa::path(
    patch,
    path = "/api/v1/users/{id}",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    request_body = UpdateUserRequest,
    responses(
        (status = 200, description = "User updated", body = UserResponse),
        (status = 409, description = "Email already in use")
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_user(
    State(state): State<UsersState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>> {
    let is_self = auth.0.user_id == id;
    if !is_self || req.is_verified.is_some() {
        auth.0.require(catalogue::USERS_WRITE)?;
    }
    let mut user = state.load_visible(&auth.0, id).await?;

    if let Some(email) = req.email {
        validate_email(&email)?;
        if let Some(other) = state.users.find_by_email(user.tenant_id, &email).await? {
            if other.id != user.id {
                return Err(DotMacError::duplicate("User", "email", email.trim()));
            }
        }
        user.set_email(&email);
    }
    if let Some(full_name) = req.full_name {
        user.full_name = Some(full_name).filter(|n| !n.trim().is_empty());
    }
    if let Some(verified) = req.is_verified {
        user.is_verified = verified;
    }
    user.updated_at = chrono::Utc::now();

    state.users.update(&user).await?;
    Ok(Json(user.into()))
}

/// Delete a user
#[utoipa::path(
    delete,
    path = "/api/v1/users/{id}",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User deleted", body = SuccessResponse),
        (status = 409, description = "Cannot delete yourself")
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_user(
    State(state): State<UsersState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::USERS_DELETE)?;
    if auth.0.user_id == id {
        return Err(DotMacError::conflict("Users cannot delete themselves"));
    }
    let user = state.load_visible(&auth.0, id).await?;

    state.auth.end_sessions(user.id).await?;
    state.users.delete(user.id).await?;
    state.rbac.invalidate_user(user.id);
    info!(user_id = %user.id, deleted_by = %auth.0.user_id, "User deleted");
    Ok(Json(SuccessResponse::ok()))
}

/// Re-enable a deactivated user
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/activate",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    responses((status = 200, description = "User activated", body = UserResponse)),
    security(("bearer_auth" = []))
)]
pub async fn activate_user(
    State(state): State<UsersState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>> {
    auth.0.require(catalogue::USERS_WRITE)?;
    let mut user = state.load_visible(&auth.0, id).await?;
    user.activate();
    state.users.update(&user).await?;
    Ok(Json(user.into()))
}

/// Deactivate a user and end their sessions
#[utoipa::path(
    post,
    path = "/api/v1/users/{id}/deactivate",
    tag = "users",
    params(("id" = Uuid, Path, description = "User id")),
    responses(
        (status = 200, description = "User deactivated", body = UserResponse),
        (status = 409, description = "Cannot deactivate yourself")
    ),
    security(("bearer_auth" = []))
)]
pub async fn deactivate_user(
    State(state): State<UsersState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<UserResponse>> {
    auth.0.require(catalogue::USERS_WRITE)?;
    if auth.0.user_id == id {
        return Err(DotMacError::conflict("Users cannot deactivate themselves"));
    }
    let mut user = state.load_visible(&auth.0, id).await?;
    user.deactivate();
    state.users.update(&user).await?;
    state.auth.end_sessions(user.id).await?;
    Ok(Json(user.into()))
}

/// Create users router
pub fn users_router(state: UsersState) -> Router {
    Router::new()
        .route("/", get(list_users))
        .route("/:id", get(get_user).patch(update_user).delete(delete_user))
        .route("/:id/activate", post(activate_user))
        .route("/:id/deactivate", post(deactivate_user))
        .with_state(state)
}
