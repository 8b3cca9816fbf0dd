//! RBAC Admin API
//!
//! Permission catalogue, roles, user assignments and overrides, and the
//! grant audit trail. Tenant administrators manage their own tenant's
//! roles and users; global roles are managed by superusers only.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::api::common::SuccessResponse;
use crate::api::middleware::Authenticated;
use crate::domain::{
    catalogue, GrantFilter, Permission, PermissionGrant, Role, User, UserPermission, UserRole,
};
use crate::error::{DotMacError, Result};
use crate::repository::UserRepository;
use crate::service::{AuthContext, CreateRoleInput, EffectivePermissions, RbacService, UpdateRoleInput};

const DEFAULT_GRANT_LIMIT: u32 = 100;
const MAX_GRANT_LIMIT: u32 = 1000;

// ----------------------------------------------------------------------
// DTOs
// ----------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub is_system: bool,
    pub created_at: String,
}

impl From<Permission> for PermissionResponse {
    fn from(p: Permission) -> Self {
        Self {
            id: p.id,
            name: p.name,
            display_name: p.display_name,
            description: p.description,
            category: p.category,
            is_system: p.is_system,
            created_at: p.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePermissionRequest {
    /// `resource:action`
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PermissionsQuery {
    pub category: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleResponse {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    pub priority: i32,
    pub is_system: bool,
    pub is_active: bool,
    pub is_default: bool,
    pub max_users: Option<i32>,
    pub permissions: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Role> for RoleResponse {
    fn from(r: Role) -> Self {
        Self {
            id: r.id,
            tenant_id: r.tenant_id,
            name: r.name,
            display_name: r.display_name,
            description: r.description,
            parent_id: r.parent_id,
            priority: r.priority,
            is_system: r.is_system,
            is_active: r.is_active,
            is_default: r.is_default,
            max_users: r.max_users,
            permissions: r.permissions.into_iter().collect(),
            created_at: r.created_at.to_rfc3339(),
            updated_at: r.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoleRequest {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    /// Superusers only; omitted means the caller's tenant
    pub tenant_id: Option<Uuid>,
    /// Create a global role (superusers only)
    #[serde(default)]
    pub global: bool,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    pub max_users: Option<i32>,
}

/// Absent fields are unchanged; `clearParent`/`clearMaxUsers` unset them
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRoleRequest {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub clear_parent: bool,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub max_users: Option<i32>,
    #[serde(default)]
    pub clear_max_users: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionRequest {
    pub permission: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleResponse {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_at: String,
    pub expires_at: Option<String>,
}

impl From<UserRole> for UserRoleResponse {
    fn from(a: UserRole) -> Self {
        Self {
            user_id: a.user_id,
            role_id: a.role_id,
            granted_by: a.granted_by,
            granted_at: a.granted_at.to_rfc3339(),
            expires_at: a.expires_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionRequest {
    pub permission: String,
    /// `false` records an explicit deny
    #[serde(default = "default_true")]
    pub granted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionResponse {
    pub user_id: Uuid,
    pub permission: String,
    pub granted: bool,
    pub granted_by: Option<Uuid>,
    pub reason: Option<String>,
    pub granted_at: String,
    pub expires_at: Option<String>,
}

impl From<UserPermission> for UserPermissionResponse {
    fn from(p: UserPermission) -> Self {
        Self {
            user_id: p.user_id,
            permission: p.permission,
            granted: p.granted,
            granted_by: p.granted_by,
            reason: p.reason,
            granted_at: p.granted_at.to_rfc3339(),
            expires_at: p.expires_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Effective access of a user with the raw assignments behind it
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePermissionsResponse {
    pub user_id: Uuid,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub denied_permissions: Vec<String>,
    pub assignments: Vec<UserRoleResponse>,
    pub overrides: Vec<UserPermissionResponse>,
}

impl EffectivePermissionsResponse {
    fn new(
        effective: &EffectivePermissions,
        assignments: Vec<UserRole>,
        overrides: Vec<UserPermission>,
    ) -> Self {
        Self {
            user_id: effective.user_id,
            roles: effective.roles.clone(),
            permissions: effective.granted.iter().cloned().collect(),
            denied_permissions: effective.denied.iter().cloned().collect(),
            assignments: assignments.into_iter().map(Into::into).collect(),
            overrides: overrides.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub permission: Option<String>,
    /// GRANT, DENY, REVOKE, EXPIRE, ROLE_ASSIGN or ROLE_REVOKE
    pub action: String,
    pub performed_by: Option<Uuid>,
    pub reason: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

impl From<PermissionGrant> for GrantResponse {
    fn from(g: PermissionGrant) -> Self {
        Self {
            id: g.id,
            tenant_id: g.tenant_id,
            user_id: g.user_id,
            role_id: g.role_id,
            permission: g.permission,
            action: g.action.as_str().to_string(),
            performed_by: g.performed_by,
            reason: g.reason,
            expires_at: g.expires_at.map(|t| t.to_rfc3339()),
            created_at: g.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct GrantsQuery {
    /// Superusers only; defaults to the caller's tenant
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct RolesQuery {
    /// Superusers only; defaults to the caller's tenant
    pub tenant_id: Option<Uuid>,
}

// ----------------------------------------------------------------------
// State and access helpers
// ----------------------------------------------------------------------

/// RBAC service state
#[derive(Clone)]
pub struct RbacApiState {
    pub rbac: Arc<RbacService>,
    pub users: Arc<dyn UserRepository>,
}

impl RbacApiState {
    async fn load_user(&self, auth: &AuthContext, user_id: Uuid) -> Result<User> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("User", user_id))?;
        auth.ensure_tenant(user.tenant_id)?;
        Ok(user)
    }

    /// Roles of other tenants are reported as missing
    async fn load_visible_role(&self, auth: &AuthContext, role_id: Uuid) -> Result<Role> {
        let role = self.rbac.get_role(role_id).await?;
        if auth.is_superuser() || role.visible_to(auth.tenant_id) {
            Ok(role)
        } else {
            Err(DotMacError::not_found("Role", role_id))
        }
    }

    /// Global roles can only be changed by superusers
    async fn load_modifiable_role(&self, auth: &AuthContext, role_id: Uuid) -> Result<Role> {
        let role = self.load_visible_role(auth, role_id).await?;
        match role.tenant_id {
            None if !auth.is_superuser() => {
                Err(DotMacError::forbidden("Global roles can only be changed by a superuser"))
            }
            _ => Ok(role),
        }
    }

    /// Holders of a global system role get platform-wide rights, so only
    /// default ones are assignable below superuser level
    async fn ensure_can_assign(&self, auth: &AuthContext, role: &Role) -> Result<()> {
        if auth.is_superuser() {
            return Ok(());
        }
        if role.is_global() && role.is_system && !role.is_default {
            return Err(DotMacError::forbidden(format!(
                "Role '{}' can only be assigned by a superuser",
                role.name
            )));
        }
        self.ensure_can_inherit(auth, role.id).await
    }

    /// Everything a role confers, inherited permissions included, must be delegable
    async fn ensure_can_inherit(&self, auth: &AuthContext, role_id: Uuid) -> Result<()> {
        if auth.is_superuser() {
            return Ok(());
        }
        let permissions = self.rbac.role_permission_set(role_id).await?;
        auth.ensure_can_delegate(permissions.iter().map(String::as_str))
    }
}

// ----------------------------------------------------------------------
// Permissions
// ----------------------------------------------------------------------

/// List the permission catalogue
#[utoipa::path(
    get,
    path = "/api/v1/rbac/permissions",
    tag = "rbac",
    params(PermissionsQuery),
    responses((status = 200, description = "Permissions", body = Vec<PermissionResponse>)),
    security(("bearer_auth" = []))
)]
pub async fn list_permissions(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Query(query): Query<PermissionsQuery>,
) -> Result<Json<Vec<PermissionResponse>>> {
    auth.0.require(catalogue::RBAC_READ)?;
    let permissions = state.rbac.list_permissions(query.category.as_deref()).await?;
    Ok(Json(permissions.into_iter().map(Into::into).collect()))
}

/// Add a permission to the catalogue (superusers only)
#[utoipa::path(
    post,
    path = "/api/v1/rbac/permissions",
    tag = "rbac",
    request_body = CreatePermissionRequest,
    responses(
        (status = 201, description = "Permission created", body = PermissionResponse),
        (status = 409, description = "Permission exists")
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_permission(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Json(req): Json<CreatePermissionRequest>,
) -> Result<(StatusCode, Json<PermissionResponse>)> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    if !auth.0.is_superuser() {
        return Err(DotMacError::forbidden("The permission catalogue is platform-wide"));
    }
    let permission = state
        .rbac
        .create_permission(&req.name, &req.display_name, req.description, req.category)
        .await?;
    Ok((StatusCode::CREATED, Json(permission.into())))
}

// ----------------------------------------------------------------------
// Roles
// ----------------------------------------------------------------------

/// List roles available to a tenant, including global roles
#[utoipa::path(
    get,
    path = "/api/v1/rbac/roles",
    tag = "rbac",
    params(RolesQuery),
    responses((status = 200, description = "Roles", body = Vec<RoleResponse>)),
    security(("bearer_auth" = []))
)]
pub async fn list_roles(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Query(query): Query<RolesQuery>,
) -> Result<Json<Vec<RoleResponse>>> {
    auth.0.require(catalogue::RBAC_READ)?;
    let tenant_id = query.tenant_id.unwrap_or(auth.0.tenant_id);
    auth.0.ensure_tenant(tenant_id)?;
    let roles = state.rbac.list_roles(Some(tenant_id)).await?;
    Ok(Json(roles.into_iter().map(Into::into).collect()))
}

/// Create a role
#[utoipa::path(
    post,
    path = "/api/v1/rbac/roles",
    tag = "rbac",
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = RoleResponse),
        (status = 400, description = "Invalid name, permission or hierarchy"),
        (status = 409, description = "Name taken or hierarchy cycle")
    ),
    security(("bearer_auth" = []))
)]
pub async fn create_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Json(req): Json<CreateRoleRequest>,
) -> Result<(StatusCode, Json<RoleResponse>)> {
    let auth = auth.0;
    auth.require(catalogue::RBAC_WRITE)?;

    let tenant_id = if req.global {
        if !auth.is_superuser() {
            return Err(DotMacError::forbidden("Global roles can only be created by a superuser"));
        }
        None
    } else {
        let tenant_id = req.tenant_id.unwrap_or(auth.tenant_id);
        auth.ensure_tenant(tenant_id)?;
        Some(tenant_id)
    };
    auth.ensure_can_delegate(req.permissions.iter().map(String::as_str))?;
    if let Some(parent_id) = req.parent_id {
        state.load_visible_role(&auth, parent_id).await?;
        state.ensure_can_inherit(&auth, parent_id).await?;
    }

    let role = state
        .rbac
        .create_role(
            &auth.execution_context(),
            CreateRoleInput {
                name: req.name,
                display_name: req.display_name,
                description: req.description,
                tenant_id,
                parent_id: req.parent_id,
                priority: req.priority,
                permissions: req.permissions,
                is_default: req.is_default,
                max_users: req.max_users,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(role.into())))
}

/// Get a role
#[utoipa::path(
    get,
    path = "/api/v1/rbac/roles/{id}",
    tag = "rbac",
    params(("id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role found", body = RoleResponse),
        (status = 404, description = "Role not found")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<RoleResponse>> {
    auth.0.require(catalogue::RBAC_READ)?;
    let role = state.load_visible_role(&auth.0, id).await?;
    Ok(Json(role.into()))
}

/// Update a role
#[utoipa::path(
    put,
    path = "/api/v1/rbac/roles/{id}",
    tag = "rbac",
    params(("id" = Uuid, Path, description = "Role id")),
    request_body = UpdateRoleRequest,
    responses(
        (status = 200, description = "Role updated", body = RoleResponse),
        (status = 403, description = "System role")
    ),
    security(("bearer_auth" = []))
)]
pub async fn update_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<Json<RoleResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_modifiable_role(&auth.0, id).await?;
    if let (Some(parent_id), false) = (req.parent_id, req.clear_parent) {
        state.load_visible_role(&auth.0, parent_id).await?;
        state.ensure_can_inherit(&auth.0, parent_id).await?;
    }

    let input = UpdateRoleInput {
        name: req.name,
        display_name: req.display_name,
        description: req.description,
        parent_id: if req.clear_parent { Some(None) } else { req.parent_id.map(Some) },
        priority: req.priority,
        is_active: req.is_active,
        is_default: req.is_default,
        max_users: if req.clear_max_users { Some(None) } else { req.max_users.map(Some) },
    };
    let role = state
        .rbac
        .update_role(&auth.0.execution_context(), id, input)
        .await?;
    Ok(Json(role.into()))
}

/// Delete a role
#[utoipa::path(
    delete,
    path = "/api/v1/rbac/roles/{id}",
    tag = "rbac",
    params(("id" = Uuid, Path, description = "Role id")),
    responses(
        (status = 200, description = "Role deleted", body = SuccessResponse),
        (status = 403, description = "System role"),
        (status = 409, description = "Role has child roles")
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_modifiable_role(&auth.0, id).await?;
    state.rbac.delete_role(&auth.0.execution_context(), id).await?;
    Ok(Json(SuccessResponse::ok()))
}

/// Add a permission to a role
#[utoipa::path(
    post,
    path = "/api/v1/rbac/roles/{id}/permissions",
    tag = "rbac",
    params(("id" = Uuid, Path, description = "Role id")),
    request_body = RolePermissionRequest,
    responses(
        (status = 200, description = "Permission granted", body = RoleResponse),
        (status = 404, description = "Unknown permission")
    ),
    security(("bearer_auth" = []))
)]
pub async fn grant_role_permission(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(id): Path<Uuid>,
    Json(req): Json<RolePermissionRequest>,
) -> Result<Json<RoleResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_modifiable_role(&auth.0, id).await?;
    auth.0.ensure_can_delegate([req.permission.as_str()])?;
    let role = state
        .rbac
        .grant_permission_to_role(&auth.0.execution_context(), id, &req.permission)
        .await?;
    Ok(Json(role.into()))
}

/// Remove a permission from a role
#[utoipa::path(
    delete,
    path = "/api/v1/rbac/roles/{id}/permissions/{permission}",
    tag = "rbac",
    params(
        ("id" = Uuid, Path, description = "Role id"),
        ("permission" = String, Path, description = "Permission name")
    ),
    responses(
        (status = 200, description = "Permission revoked", body = RoleResponse),
        (status = 404, description = "Role lacks the permission")
    ),
    security(("bearer_auth" = []))
)]
pub async fn revoke_role_permission(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path((id, permission)): Path<(Uuid, String)>,
) -> Result<Json<RoleResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_modifiable_role(&auth.0, id).await?;
    let role = state
        .rbac
        .revoke_permission_from_role(&auth.0.execution_context(), id, &permission)
        .await?;
    Ok(Json(role.into()))
}

// ----------------------------------------------------------------------
// User assignments and overrides
// ----------------------------------------------------------------------

/// Effective permissions of a user
#[utoipa::path(
    get,
    path = "/api/v1/rbac/users/{user_id}/permissions",
    tag = "rbac",
    params(("user_id" = Uuid, Path, description = "User id")),
    responses((status = 200, description = "Effective permissions", body = EffectivePermissionsResponse)),
    security(("bearer_auth" = []))
)]
pub async fn get_user_permissions(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EffectivePermissionsResponse>> {
    auth.0.require(catalogue::RBAC_READ)?;
    state.load_user(&auth.0, user_id).await?;
    let effective = state.rbac.effective_permissions(user_id).await?;
    let assignments = state.rbac.list_user_roles(user_id).await?;
    let overrides = state.rbac.list_user_overrides(user_id).await?;
    Ok(Json(EffectivePermissionsResponse::new(&effective, assignments, overrides)))
}

/// Caller's own effective permissions
#[utoipa::path(
    get,
    path = "/api/v1/rbac/me/permissions",
    tag = "rbac",
    responses((status = 200, description = "Effective permissions", body = EffectivePermissionsResponse)),
    security(("bearer_auth" = []))
)]
pub async fn my_permissions(
    State(state): State<RbacApiState>,
    auth: Authenticated,
) -> Result<Json<EffectivePermissionsResponse>> {
    let user_id = auth.0.user_id;
    let assignments = state.rbac.list_user_roles(user_id).await?;
    let overrides = state.rbac.list_user_overrides(user_id).await?;
    Ok(Json(EffectivePermissionsResponse::new(&auth.0.permissions, assignments, overrides)))
}

/// Assign a role to a user
#[utoipa::path(
    post,
    path = "/api/v1/rbac/users/{user_id}/roles",
    tag = "rbac",
    params(("user_id" = Uuid, Path, description = "User id")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = UserRoleResponse),
        (status = 403, description = "Role confers permissions the caller lacks"),
        (status = 409, description = "Role inactive or full")
    ),
    security(("bearer_auth" = []))
)]
pub async fn assign_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<(StatusCode, Json<UserRoleResponse>)> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_user(&auth.0, user_id).await?;
    let role = state.load_visible_role(&auth.0, req.role_id).await?;
    state.ensure_can_assign(&auth.0, &role).await?;
    let assignment = state
        .rbac
        .assign_role(&auth.0.execution_context(), user_id, req.role_id, req.expires_at)
        .await?;
    Ok((StatusCode::CREATED, Json(assignment.into())))
}

/// Remove a role from a user
#[utoipa::path(
    delete,
    path = "/api/v1/rbac/users/{user_id}/roles/{role_id}",
    tag = "rbac",
    params(
        ("user_id" = Uuid, Path, description = "User id"),
        ("role_id" = Uuid, Path, description = "Role id")
    ),
    responses(
        (status = 200, description = "Role revoked", body = SuccessResponse),
        (status = 404, description = "Role not assigned")
    ),
    security(("bearer_auth" = []))
)]
pub async fn revoke_role(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_user(&auth.0, user_id).await?;
    state
        .rbac
        .revoke_role(&auth.0.execution_context(), user_id, role_id)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

/// Grant or deny a permission directly to a user
#[utoipa::path(
    post,
    path = "/api/v1/rbac/users/{user_id}/permissions",
    tag = "rbac",
    params(("user_id" = Uuid, Path, description = "User id")),
    request_body = UserPermissionRequest,
    responses(
        (status = 201, description = "Override recorded", body = UserPermissionResponse),
        (status = 403, description = "Permission not held by the caller")
    ),
    security(("bearer_auth" = []))
)]
pub async fn set_user_permission(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UserPermissionRequest>,
) -> Result<(StatusCode, Json<UserPermissionResponse>)> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_user(&auth.0, user_id).await?;
    if req.granted {
        auth.0.ensure_can_delegate([req.permission.as_str()])?;
    }
    let ctx = auth.0.execution_context();
    let entry = if req.granted {
        state
            .rbac
            .grant_user_permission(&ctx, user_id, &req.permission, req.expires_at, req.reason)
            .await?
    } else {
        state
            .rbac
            .deny_user_permission(&ctx, user_id, &req.permission, req.expires_at, req.reason)
            .await?
    };
    Ok((StatusCode::CREATED, Json(entry.into())))
}

/// Remove a direct permission override
#[utoipa::path(
    delete,
    path = "/api/v1/rbac/users/{user_id}/permissions/{permission}",
    tag = "rbac",
    params(
        ("user_id" = Uuid, Path, description = "User id"),
        ("permission" = String, Path, description = "Permission name")
    ),
    responses(
        (status = 200, description = "Override removed", body = SuccessResponse),
        (status = 404, description = "No such override")
    ),
    security(("bearer_auth" = []))
)]
pub async fn remove_user_permission(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Path((user_id, permission)): Path<(Uuid, String)>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::RBAC_WRITE)?;
    state.load_user(&auth.0, user_id).await?;
    state
        .rbac
        .remove_user_permission(&auth.0.execution_context(), user_id, &permission)
        .await?;
    Ok(Json(SuccessResponse::ok()))
}

/// Grant audit trail, newest first
#[utoipa::path(
    get,
    path = "/api/v1/rbac/grants",
    tag = "rbac",
    params(GrantsQuery),
    responses((status = 200, description = "Audit entries", body = Vec<GrantResponse>)),
    security(("bearer_auth" = []))
)]
pub async fn list_grants(
    State(state): State<RbacApiState>,
    auth: Authenticated,
    Query(query): Query<GrantsQuery>,
) -> Result<Json<Vec<GrantResponse>>> {
    auth.0.require(catalogue::RBAC_READ)?;
    let tenant_id = match query.tenant_id {
        Some(tenant_id) => {
            auth.0.ensure_tenant(tenant_id)?;
            Some(tenant_id)
        }
        None if auth.0.is_superuser() => None,
        None => Some(auth.0.tenant_id),
    };

    let filter = GrantFilter {
        tenant_id,
        user_id: query.user_id,
        role_id: query.role_id,
        limit: query.limit.unwrap_or(DEFAULT_GRANT_LIMIT).clamp(1, MAX_GRANT_LIMIT),
    };
    let grants = state.rbac.list_grants(&filter).await?;
    Ok(Json(grants.into_iter().map(Into::into).collect()))
}

/// Create RBAC router
pub fn rbac_router(state: RbacApiState) -> Router {
    Router::new()
        .route("/permissions", get(list_permissions).post(create_permission))
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:id", get(get_role).put(update_role).delete(delete_role))
        .route("/roles/:id/permissions", post(grant_role_permission))
        .route("/roles/:id/permissions/:permission", delete(revoke_role_permission))
        .route("/users/:user_id/permissions", get(get_user_permissions).post(set_user_permission))
        .route("/users/:user_id/permissions/:permission", delete(remove_user_permission))
        .route("/users/:user_id/roles", post(assign_role))
        .route("/users/:user_id/roles/:role_id", delete(revoke_role))
        .route("/grants", get(list_grants))
        .route("/me/permissions", get(my_permissions))
        .with_state(state)
}
