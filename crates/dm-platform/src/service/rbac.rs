//! RBAC Service
//!
//! Resolves a user's effective permissions from role assignments, role
//! inheritance and direct overrides, and owns every mutation of the RBAC
//! schema. Each mutation is written to the grant audit trail and published
//! as a domain event.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    catalogue, permission_matches, system_roles, validate_permission_name, validate_role_name,
    GrantAction, GrantFilter, Permission, PermissionGrant, Role, UserPermission, UserRole, WILDCARD,
};
use crate::error::{DotMacError, Result};
use crate::events::rbac::{
    RoleCreated, RoleDeleted, RolePermissionGranted, RolePermissionRevoked, RoleUpdated,
    UserGrantExpired, UserPermissionGranted, UserPermissionRevoked, UserRoleAssigned,
    UserRoleRevoked,
};
use crate::events::{AggregateRoot, DomainEventPublisher, ExecutionContext};
use crate::repository::{RbacRepository, UserRepository};

/// Resolved permissions of one user
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePermissions {
    pub user_id: Uuid,
    /// Names of directly assigned, active roles
    pub roles: Vec<String>,
    /// Permissions from roles, inherited roles and allow overrides
    pub granted: BTreeSet<String>,
    /// Explicit deny overrides
    pub denied: BTreeSet<String>,
}

impl EffectivePermissions {
    /// A matching deny always wins over any grant
    pub fn allows(&self, permission: &str) -> bool {
        if self.denied.iter().any(|d| permission_matches(d, permission)) {
            return false;
        }
        self.granted.iter().any(|g| permission_matches(g, permission))
    }

    pub fn is_superuser(&self) -> bool {
        self.granted.contains(WILDCARD) && self.denied.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct CreateRoleInput {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub priority: i32,
    pub permissions: Vec<String>,
    pub is_default: bool,
    pub max_users: Option<i32>,
}

/// Fields left `None` are unchanged. The nested options clear the value
/// when set to `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct UpdateRoleInput {
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<Option<Uuid>>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
    pub is_default: Option<bool>,
    pub max_users: Option<Option<i32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub roles_expired: usize,
    pub permissions_expired: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub permissions_created: usize,
    pub roles_created: usize,
}

struct CachedPermissions {
    computed_at: Instant,
    permissions: Arc<EffectivePermissions>,
}

pub struct RbacService {
    repo: Arc<dyn RbacRepository>,
    users: Arc<dyn UserRepository>,
    publisher: Arc<DomainEventPublisher>,
    cache: DashMap<Uuid, CachedPermissions>,
    /// Bumped per user on invalidation, before the cache entry is dropped
    generations: DashMap<Uuid, u64>,
    /// Bumped by `invalidate_all`
    epoch: AtomicU64,
    cache_ttl: Duration,
    max_depth: usize,
}

/// Invalidation state observed before a resolution started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CacheStamp {
    epoch: u64,
    generation: u64,
}

impl RbacService {
    pub fn new(
        repo: Arc<dyn RbacRepository>,
        users: Arc<dyn UserRepository>,
        publisher: Arc<DomainEventPublisher>,
    ) -> Self {
        Self {
            repo,
            users,
            publisher,
            cache: DashMap::new(),
            generations: DashMap::new(),
            epoch: AtomicU64::new(0),
            cache_ttl: Duration::from_secs(300),
            max_depth: 10,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth.max(1);
        self
    }

    pub fn repository(&self) -> &Arc<dyn RbacRepository> {
        &self.repo
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    pub async fn effective_permissions(&self, user_id: Uuid) -> Result<Arc<EffectivePermissions>> {
        if let Some(cached) = self.cache.get(&user_id) {
            if cached.computed_at.elapsed() < self.cache_ttl {
                return Ok(cached.permissions.clone());
            }
        }

        let stamp = self.stamp(user_id);
        let permissions = Arc::new(self.resolve(user_id, Utc::now()).await?);
        self.cache_resolved(user_id, stamp, permissions.clone());
        Ok(permissions)
    }

    fn stamp(&self, user_id: Uuid) -> CacheStamp {
        CacheStamp {
            epoch: self.epoch.load(Ordering::SeqCst),
            generation: self.generations.get(&user_id).map_or(0, |g| *g),
        }
    }

    /// Caches a resolution unless an invalidation happened while it ran.
    /// The stamp is checked again after inserting so an invalidation racing
    /// the insert cannot leave the stale entry behind.
    fn cache_resolved(&self, user_id: Uuid, stamp: CacheStamp, permissions: Arc<EffectivePermissions>) {
        if self.stamp(user_id) != stamp {
            debug!(user_id = %user_id, "Discarding permissions resolved before an invalidation");
            return;
        }
        self.cache.insert(
            user_id,
            CachedPermissions {
                computed_at: Instant::now(),
                permissions,
            },
        );
        if self.stamp(user_id) != stamp {
            self.cache.remove(&user_id);
        }
    }

    async fn resolve(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<EffectivePermissions> {
        let mut result = EffectivePermissions {
            user_id,
            ..Default::default()
        };

        // Roles are shared between chains, so load each at most once
        let mut loaded: HashMap<Uuid, Option<Role>> = HashMap::new();

        for assignment in self.repo.list_user_roles(user_id).await? {
            if !assignment.is_active(now) {
                continue;
            }
            let Some(role) = self.load_role(&mut loaded, assignment.role_id).await? else {
                continue;
            };
            if !role.is_active {
                continue;
            }
            result.roles.push(role.name.clone());

            let mut visited = HashSet::new();
            let mut current = Some(role);
            let mut depth = 0;
            while let Some(role) = current.take() {
                if !visited.insert(role.id) {
                    warn!(role_id = %role.id, user_id = %user_id, "Cycle in role hierarchy");
                    break;
                }
                result.granted.extend(role.permissions.iter().cloned());

                depth += 1;
                if depth >= self.max_depth {
                    break;
                }
                if let Some(parent_id) = role.parent_id {
                    current = self
                        .load_role(&mut loaded, parent_id)
                        .await?
                        .filter(|parent| parent.is_active);
                }
            }
        }

        for grant in self.repo.list_user_permissions(user_id).await? {
            if !grant.is_active(now) {
                continue;
            }
            if grant.granted {
                result.granted.insert(grant.permission);
            } else {
                result.denied.insert(grant.permission);
            }
        }

        debug!(
            user_id = %user_id,
            roles = result.roles.len(),
            granted = result.granted.len(),
            denied = result.denied.len(),
            "Resolved effective permissions"
        );
        Ok(result)
    }

    async fn load_role(
        &self,
        loaded: &mut HashMap<Uuid, Option<Role>>,
        role_id: Uuid,
    ) -> Result<Option<Role>> {
        if let Some(role) = loaded.get(&role_id) {
            return Ok(role.clone());
        }
        let role = self.repo.find_role(role_id).await?;
        loaded.insert(role_id, role.clone());
        Ok(role)
    }

    pub async fn has_permission(&self, user_id: Uuid, permission: &str) -> Result<bool> {
        let allowed = self.effective_permissions(user_id).await?.allows(permission);
        let result = if allowed { "allowed" } else { "denied" };
        metrics::counter!("dm_permission_checks_total", "result" => result).increment(1);
        Ok(allowed)
    }

    pub async fn has_any_permission(&self, user_id: Uuid, permissions: &[&str]) -> Result<bool> {
        let effective = self.effective_permissions(user_id).await?;
        Ok(permissions.iter().any(|p| effective.allows(p)))
    }

    pub async fn has_all_permissions(&self, user_id: Uuid, permissions: &[&str]) -> Result<bool> {
        let effective = self.effective_permissions(user_id).await?;
        Ok(permissions.iter().all(|p| effective.allows(p)))
    }

    pub fn invalidate_user(&self, user_id: Uuid) {
        *self.generations.entry(user_id).or_insert(0) += 1;
        self.cache.remove(&user_id);
    }

    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache.clear();
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub async fn create_permission(
        &self,
        name: &str,
        display_name: &str,
        description: Option<String>,
        category: Option<String>,
    ) -> Result<Permission> {
        validate_permission_name(name)?;
        let mut permission = Permission::new(name, display_name);
        permission.description = description;
        permission.category = category;
        self.repo.insert_permission(&permission).await?;
        info!(permission = %name, "Permission created");
        Ok(permission)
    }

    pub async fn list_permissions(&self, category: Option<&str>) -> Result<Vec<Permission>> {
        self.repo.list_permissions(category).await
    }

    /// Concrete permissions must exist; wildcard patterns only need a valid name
    async fn ensure_permission_known(&self, name: &str) -> Result<()> {
        validate_permission_name(name)?;
        if name == WILDCARD || name.ends_with(":*") {
            return Ok(());
        }
        if self.repo.find_permission(name).await?.is_none() {
            return Err(DotMacError::not_found("Permission", name));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    pub async fn get_role(&self, role_id: Uuid) -> Result<Role> {
        self.repo
            .find_role(role_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("Role", role_id))
    }

    pub async fn list_roles(&self, tenant_id: Option<Uuid>) -> Result<Vec<Role>> {
        self.repo.list_roles(tenant_id).await
    }

    /// Active default roles a new user of the tenant receives
    pub async fn default_roles(&self, tenant_id: Uuid) -> Result<Vec<Role>> {
        Ok(self
            .repo
            .list_roles(Some(tenant_id))
            .await?
            .into_iter()
            .filter(|r| r.is_default && r.is_active)
            .collect())
    }

    /// Permissions a holder of the role receives, inherited ones included
    pub async fn role_permission_set(&self, role_id: Uuid) -> Result<BTreeSet<String>> {
        let chain = self.ancestry(role_id).await?;
        if chain.is_empty() {
            return Err(DotMacError::not_found("Role", role_id));
        }
        Ok(chain
            .into_iter()
            .filter(|r| r.is_active)
            .flat_map(|r| r.permissions)
            .collect())
    }

    /// Role and its ancestors, nearest first. Stops at a cycle.
    async fn ancestry(&self, role_id: Uuid) -> Result<Vec<Role>> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(role_id);
        while let Some(id) = next {
            if !visited.insert(id) {
                break;
            }
            let Some(role) = self.repo.find_role(id).await? else {
                break;
            };
            next = role.parent_id;
            chain.push(role);
        }
        Ok(chain)
    }

    /// Number of levels below the role, counting the role itself as 1
    async fn subtree_height(&self, role_id: Uuid) -> Result<usize> {
        let mut height = 1;
        let mut frontier = vec![role_id];
        let mut visited: HashSet<Uuid> = HashSet::from([role_id]);
        while !frontier.is_empty() && height <= self.max_depth {
            let mut next = Vec::new();
            for id in frontier {
                for child in self.repo.list_child_roles(id).await? {
                    if visited.insert(child.id) {
                        next.push(child.id);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            height += 1;
            frontier = next;
        }
        Ok(height)
    }

    /// Validate that `role` may hang below `parent_id`
    async fn check_parent(&self, role: &Role, parent_id: Uuid, subtree_height: usize) -> Result<()> {
        if parent_id == role.id {
            return Err(DotMacError::field("parentId", "A role cannot be its own parent"));
        }
        let parent = self
            .repo
            .find_role(parent_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("Role", parent_id))?;

        // A tenant role may inherit from a global role or a role of the same tenant
        if let Some(parent_tenant) = parent.tenant_id {
            if role.tenant_id != Some(parent_tenant) {
                return Err(DotMacError::field(
                    "parentId",
                    "Parent role belongs to another tenant",
                ));
            }
        }

        let ancestry = self.ancestry(parent_id).await?;
        if ancestry.iter().any(|r| r.id == role.id) {
            return Err(DotMacError::conflict(format!(
                "Setting parent {} on role '{}' would create a cycle",
                parent_id, role.name
            )));
        }
        if ancestry.len() + subtree_height > self.max_depth {
            return Err(DotMacError::field(
                "parentId",
                format!("Role hierarchy would exceed the maximum depth of {}", self.max_depth),
            ));
        }
        Ok(())
    }

    pub async fn create_role(&self, ctx: &ExecutionContext, input: CreateRoleInput) -> Result<Role> {
        validate_role_name(&input.name)?;
        if input.display_name.trim().is_empty() {
            return Err(DotMacError::field("displayName", "Display name is required"));
        }
        if matches!(input.max_users, Some(m) if m < 1) {
            return Err(DotMacError::field("maxUsers", "maxUsers must be at least 1"));
        }
        if self.repo.find_role_by_name(input.tenant_id, &input.name).await?.is_some() {
            return Err(DotMacError::duplicate("Role", "name", &input.name));
        }
        for permission in &input.permissions {
            self.ensure_permission_known(permission).await?;
        }

        let mut role = Role::new(&input.name, input.display_name.trim())
            .with_priority(input.priority)
            .with_permissions(input.permissions.iter().cloned());
        role.tenant_id = input.tenant_id;
        role.description = input.description;
        role.is_default = input.is_default;
        role.max_users = input.max_users;

        if let Some(parent_id) = input.parent_id {
            self.check_parent(&role, parent_id, 1).await?;
            role.parent_id = Some(parent_id);
        }

        self.repo.insert_role(&role).await?;

        for permission in &role.permissions {
            self.audit(
                PermissionGrant::new(GrantAction::Grant)
                    .tenant(role.tenant_id)
                    .role(role.id)
                    .permission(permission.as_str())
                    .performed_by(ctx.principal_id),
            )
            .await?;
        }

        role.record(&RoleCreated::new(ctx, &role));
        self.publisher.publish_all(role.take_events()).await;

        info!(role_id = %role.id, name = %role.name, "Role created");
        Ok(role)
    }

    pub async fn update_role(
        &self,
        ctx: &ExecutionContext,
        role_id: Uuid,
        input: UpdateRoleInput,
    ) -> Result<Role> {
        let mut role = self.get_role(role_id).await?;
        if !role.can_modify() {
            return Err(DotMacError::forbidden(format!("System role '{}' cannot be modified", role.name)));
        }

        if let Some(name) = input.name {
            validate_role_name(&name)?;
            if name != role.name {
                if self.repo.find_role_by_name(role.tenant_id, &name).await?.is_some() {
                    return Err(DotMacError::duplicate("Role", "name", &name));
                }
                role.name = name;
            }
        }
        if let Some(display_name) = input.display_name {
            if display_name.trim().is_empty() {
                return Err(DotMacError::field("displayName", "Display name is required"));
            }
            role.display_name = display_name.trim().to_string();
        }
        if let Some(description) = input.description {
            role.description = Some(description);
        }
        if let Some(priority) = input.priority {
            role.priority = priority;
        }
        if let Some(is_active) = input.is_active {
            role.is_active = is_active;
        }
        if let Some(is_default) = input.is_default {
            role.is_default = is_default;
        }
        if let Some(max_users) = input.max_users {
            if matches!(max_users, Some(m) if m < 1) {
                return Err(DotMacError::field("maxUsers", "maxUsers must be at least 1"));
            }
            role.max_users = max_users;
        }
        if let Some(parent_id) = input.parent_id {
            if parent_id != role.parent_id {
                if let Some(parent_id) = parent_id {
                    let height = self.subtree_height(role.id).await?;
                    self.check_parent(&role, parent_id, height).await?;
                }
                role.parent_id = parent_id;
            }
        }

        role.updated_at = Utc::now();
        self.repo.update_role(&role).await?;
        self.invalidate_all();

        role.record(&RoleUpdated::new(ctx, &role));
        self.publisher.publish_all(role.take_events()).await;

        info!(role_id = %role.id, "Role updated");
        Ok(role)
    }

    pub async fn delete_role(&self, ctx: &ExecutionContext, role_id: Uuid) -> Result<()> {
        let mut role = self.get_role(role_id).await?;
        if !role.can_modify() {
            return Err(DotMacError::forbidden(format!("System role '{}' cannot be deleted", role.name)));
        }
        let children = self.repo.list_child_roles(role_id).await?;
        if !children.is_empty() {
            return Err(DotMacError::conflict(format!(
                "Role '{}' has {} child role(s)",
                role.name,
                children.len()
            )));
        }

        self.repo.delete_role(role_id).await?;
        self.invalidate_all();

        self.audit(
            PermissionGrant::new(GrantAction::Revoke)
                .tenant(role.tenant_id)
                .role(role.id)
                .performed_by(ctx.principal_id)
                .reason(Some(format!("role '{}' deleted", role.name))),
        )
        .await?;

        role.record(&RoleDeleted::new(ctx, &role));
        self.publisher.publish_all(role.take_events()).await;

        info!(role_id = %role_id, "Role deleted");
        Ok(())
    }

    /// Adding a permission the role already has is a no-op
    pub async fn grant_permission_to_role(
        &self,
        ctx: &ExecutionContext,
        role_id: Uuid,
        permission: &str,
    ) -> Result<Role> {
        let mut role = self.get_role(role_id).await?;
        if !role.can_modify() {
            return Err(DotMacError::forbidden(format!("System role '{}' cannot be modified", role.name)));
        }
        self.ensure_permission_known(permission).await?;

        if !role.grant_permission(permission) {
            return Ok(role);
        }
        self.repo.update_role(&role).await?;
        self.invalidate_all();

        self.audit(
            PermissionGrant::new(GrantAction::Grant)
                .tenant(role.tenant_id)
                .role(role.id)
                .permission(permission)
                .performed_by(ctx.principal_id),
        )
        .await?;

        role.record(&RolePermissionGranted::new(ctx, &role, permission));
        self.publisher.publish_all(role.take_events()).await;
        Ok(role)
    }

    pub async fn revoke_permission_from_role(
        &self,
        ctx: &ExecutionContext,
        role_id: Uuid,
        permission: &str,
    ) -> Result<Role> {
        let mut role = self.get_role(role_id).await?;
        if !role.can_modify() {
            return Err(DotMacError::forbidden(format!("System role '{}' cannot be modified", role.name)));
        }
        if !role.revoke_permission(permission) {
            return Err(DotMacError::not_found("RolePermission", permission));
        }
        self.repo.update_role(&role).await?;
        self.invalidate_all();

        self.audit(
            PermissionGrant::new(GrantAction::Revoke)
                .tenant(role.tenant_id)
                .role(role.id)
                .permission(permission)
                .performed_by(ctx.principal_id),
        )
        .await?;

        role.record(&RolePermissionRevoked::new(ctx, &role, permission));
        self.publisher.publish_all(role.take_events()).await;
        Ok(role)
    }

    // ------------------------------------------------------------------
    // Assignments and overrides
    // ------------------------------------------------------------------

    pub async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        self.repo.list_user_roles(user_id).await
    }

    pub async fn list_user_overrides(&self, user_id: Uuid) -> Result<Vec<UserPermission>> {
        self.repo.list_user_permissions(user_id).await
    }

    pub async fn assign_role(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        role_id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserRole> {
        let now = Utc::now();
        if matches!(expires_at, Some(e) if e <= now) {
            return Err(DotMacError::field("expiresAt", "Expiry must be in the future"));
        }

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("User", user_id))?;
        let role = self.get_role(role_id).await?;

        if !role.visible_to(user.tenant_id) {
            return Err(DotMacError::forbidden(format!(
                "Role '{}' is not available to this user's tenant",
                role.name
            )));
        }
        if !role.is_active {
            return Err(DotMacError::conflict(format!("Role '{}' is inactive", role.name)));
        }

        let already_assigned = self
            .repo
            .list_user_roles(user_id)
            .await?
            .iter()
            .any(|a| a.role_id == role_id && a.is_active(now));
        if let Some(max_users) = role.max_users {
            let members = self.repo.count_role_members(role_id, now).await?;
            if !already_assigned && members >= max_users as i64 {
                return Err(DotMacError::conflict(format!(
                    "Role '{}' already has the maximum of {} users",
                    role.name, max_users
                )));
            }
        }

        let assignment = UserRole::new(user_id, role_id)
            .granted_by(ctx.principal_id)
            .expires_at(expires_at);
        self.repo.upsert_user_role(&assignment).await?;
        self.invalidate_user(user_id);

        self.audit(
            PermissionGrant::new(GrantAction::RoleAssign)
                .tenant(Some(user.tenant_id))
                .user(user_id)
                .role(role_id)
                .performed_by(ctx.principal_id)
                .expires_at(expires_at),
        )
        .await?;
        self.publisher
            .publish(&UserRoleAssigned::new(ctx, user_id, &role, expires_at))
            .await;

        info!(user_id = %user_id, role = %role.name, "Role assigned");
        Ok(assignment)
    }

    pub async fn revoke_role(&self, ctx: &ExecutionContext, user_id: Uuid, role_id: Uuid) -> Result<()> {
        if !self.repo.delete_user_role(user_id, role_id).await? {
            return Err(DotMacError::not_found("UserRole", format!("{}/{}", user_id, role_id)));
        }
        self.invalidate_user(user_id);

        self.audit(
            PermissionGrant::new(GrantAction::RoleRevoke)
                .tenant(self.user_tenant(user_id).await?)
                .user(user_id)
                .role(role_id)
                .performed_by(ctx.principal_id),
        )
        .await?;
        self.publisher
            .publish(&UserRoleRevoked::new(ctx, user_id, role_id))
            .await;

        info!(user_id = %user_id, role_id = %role_id, "Role revoked");
        Ok(())
    }

    pub async fn grant_user_permission(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<UserPermission> {
        self.set_override(ctx, user_id, permission, true, expires_at, reason).await
    }

    pub async fn deny_user_permission(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<UserPermission> {
        self.set_override(ctx, user_id, permission, false, expires_at, reason).await
    }

    async fn set_override(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
        granted: bool,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<UserPermission> {
        if matches!(expires_at, Some(e) if e <= Utc::now()) {
            return Err(DotMacError::field("expiresAt", "Expiry must be in the future"));
        }
        self.ensure_permission_known(permission).await?;
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("User", user_id))?;

        let entry = if granted {
            UserPermission::allow(user_id, permission)
        } else {
            UserPermission::deny(user_id, permission)
        }
        .granted_by(ctx.principal_id)
        .with_reason(reason.clone())
        .expires_at(expires_at);

        self.repo.upsert_user_permission(&entry).await?;
        self.invalidate_user(user_id);

        let action = if granted { GrantAction::Grant } else { GrantAction::Deny };
        self.audit(
            PermissionGrant::new(action)
                .tenant(Some(user.tenant_id))
                .user(user_id)
                .permission(permission)
                .performed_by(ctx.principal_id)
                .reason(reason.clone())
                .expires_at(expires_at),
        )
        .await?;
        self.publisher
            .publish(&UserPermissionGranted::new(ctx, user_id, permission, granted, reason, expires_at))
            .await;

        info!(user_id = %user_id, permission = %permission, granted, "User permission override set");
        Ok(entry)
    }

    pub async fn remove_user_permission(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
    ) -> Result<()> {
        if !self.repo.delete_user_permission(user_id, permission).await? {
            return Err(DotMacError::not_found("UserPermission", format!("{}/{}", user_id, permission)));
        }
        self.invalidate_user(user_id);

        self.audit(
            PermissionGrant::new(GrantAction::Revoke)
                .tenant(self.user_tenant(user_id).await?)
                .user(user_id)
                .permission(permission)
                .performed_by(ctx.principal_id),
        )
        .await?;
        self.publisher
            .publish(&UserPermissionRevoked::new(ctx, user_id, permission))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit and maintenance
    // ------------------------------------------------------------------

    async fn audit(&self, grant: PermissionGrant) -> Result<()> {
        self.repo.insert_grant(&grant).await
    }

    pub async fn list_grants(&self, filter: &GrantFilter) -> Result<Vec<PermissionGrant>> {
        self.repo.list_grants(filter).await
    }

    /// Remove lapsed assignments and overrides
    pub async fn expire_grants(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let ctx = ExecutionContext::system();
        let roles = self.repo.delete_expired_user_roles(now).await?;
        let permissions = self.repo.delete_expired_user_permissions(now).await?;

        for assignment in &roles {
            let tenant_id = self.user_tenant(assignment.user_id).await?;
            self.invalidate_user(assignment.user_id);
            self.audit(
                PermissionGrant::new(GrantAction::Expire)
                    .tenant(tenant_id)
                    .user(assignment.user_id)
                    .role(assignment.role_id)
                    .expires_at(assignment.expires_at),
            )
            .await?;
            let ctx = ctx.clone().with_tenant(tenant_id);
            self.publisher
                .publish(&UserGrantExpired::role(&ctx, assignment.user_id, assignment.role_id, now))
                .await;
        }

        for grant in &permissions {
            let tenant_id = self.user_tenant(grant.user_id).await?;
            self.invalidate_user(grant.user_id);
            self.audit(
                PermissionGrant::new(GrantAction::Expire)
                    .tenant(tenant_id)
                    .user(grant.user_id)
                    .permission(grant.permission.as_str())
                    .expires_at(grant.expires_at),
            )
            .await?;
            let ctx = ctx.clone().with_tenant(tenant_id);
            self.publisher
                .publish(&UserGrantExpired::permission(&ctx, grant.user_id, &grant.permission, now))
                .await;
        }

        let report = ExpiryReport {
            roles_expired: roles.len(),
            permissions_expired: permissions.len(),
        };
        if report != ExpiryReport::default() {
            info!(
                roles = report.roles_expired,
                permissions = report.permissions_expired,
                "Expired RBAC grants"
            );
        }
        Ok(report)
    }

    async fn user_tenant(&self, user_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.users.find_by_id(user_id).await?.map(|u| u.tenant_id))
    }

    /// Seed the permission catalogue and system roles. Safe to run on every start.
    pub async fn bootstrap_defaults(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();

        let all = std::iter::once((WILDCARD, "All permissions", "platform"))
            .chain(catalogue::ALL.iter().copied());
        for (name, display_name, category) in all {
            if self.repo.find_permission(name).await?.is_none() {
                let permission = Permission::new(name, display_name).with_category(category).system();
                self.repo.insert_permission(&permission).await?;
                report.permissions_created += 1;
            }
        }

        let roles = [
            Role::new(system_roles::SUPER_ADMIN, "Super Administrator")
                .with_description("Unrestricted access to every tenant")
                .with_priority(1000)
                .with_permission(WILDCARD)
                .system(),
            Role::new(system_roles::TENANT_ADMIN, "Tenant Administrator")
                .with_description("Manages users, roles and secrets of a tenant")
                .with_priority(500)
                .with_permissions(["users:*", "rbac:*", "secrets:*", "geo:*"])
                .system(),
            Role::new(system_roles::USER, "User")
                .with_description("Default role of every registered user")
                .with_permissions([catalogue::USERS_READ_SELF, catalogue::GEO_READ])
                .system()
                .default_role(),
        ];
        for role in roles {
            if self.repo.find_role_by_name(None, &role.name).await?.is_none() {
                self.repo.insert_role(&role).await?;
                report.roles_created += 1;
            }
        }

        if report != BootstrapReport::default() {
            info!(
                permissions = report.permissions_created,
                roles = report.roles_created,
                "Seeded RBAC defaults"
            );
            self.invalidate_all();
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::User;
    use crate::events::{handler_fn, DomainEventDispatcher, EventEnvelope};
    use crate::repository::{MemoryRbacRepository, MemoryUserRepository};
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;

    struct Fixture {
        rbac: RbacService,
        users: Arc<MemoryUserRepository>,
        repo: Arc<MemoryRbacRepository>,
        events: Arc<Mutex<Vec<EventEnvelope>>>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryRbacRepository::new());
        let users = Arc::new(MemoryUserRepository::new());
        let dispatcher = Arc::new(DomainEventDispatcher::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        dispatcher.subscribe(
            "*",
            handler_fn("collect", move |e| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(e);
                    Ok(())
                }
            }),
        );
        let publisher = Arc::new(DomainEventPublisher::new(dispatcher, "test"));
        let rbac = RbacService::new(repo.clone(), users.clone(), publisher).with_max_depth(3);
        Fixture { rbac, users, repo, events }
    }

    fn role_input(name: &str, permissions: &[&str]) -> CreateRoleInput {
        CreateRoleInput {
            name: name.to_string(),
            display_name: name.to_string(),
            description: None,
            tenant_id: None,
            parent_id: None,
            priority: 0,
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            is_default: false,
            max_users: None,
        }
    }

    async fn user(f: &Fixture) -> User {
        let username = format!("u{}", &Uuid::new_v4().simple().to_string()[..8]);
        let email = format!("{}@example.com", username);
        let u = User::new(Uuid::new_v4(), username, email, "h");
        f.users.insert(&u).await.unwrap();
        u
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::system()
    }

    #[tokio::test]
    async fn test_inherited_permissions() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();

        let base = f.rbac.create_role(&ctx(), role_input("viewer", &["users:read"])).await.unwrap();
        let mut editor = role_input("editor", &["users:write"]);
        editor.parent_id = Some(base.id);
        let editor = f.rbac.create_role(&ctx(), editor).await.unwrap();

        let u = user(&f).await;
        f.rbac.assign_role(&ctx(), u.id, editor.id, None).await.unwrap();

        assert!(f.rbac.has_permission(u.id, "users:read").await.unwrap());
        assert!(f.rbac.has_permission(u.id, "users:write").await.unwrap());
        assert!(!f.rbac.has_permission(u.id, "users:delete").await.unwrap());
        assert!(f.rbac.has_all_permissions(u.id, &["users:read", "users:write"]).await.unwrap());
        assert!(f.rbac.has_any_permission(u.id, &["users:delete", "users:read"]).await.unwrap());
    }

    #[tokio::test]
    async fn test_deny_override_wins() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let admin = f
            .repo
            .find_role_by_name(None, system_roles::TENANT_ADMIN)
            .await
            .unwrap()
            .unwrap();

        let u = user(&f).await;
        f.rbac.assign_role(&ctx(), u.id, admin.id, None).await.unwrap();
        assert!(f.rbac.has_permission(u.id, "users:delete").await.unwrap());

        f.rbac
            .deny_user_permission(&ctx(), u.id, "users:delete", None, Some("offboarding".into()))
            .await
            .unwrap();
        assert!(!f.rbac.has_permission(u.id, "users:delete").await.unwrap());
        assert!(f.rbac.has_permission(u.id, "users:read").await.unwrap());

        let grants = f
            .rbac
            .list_grants(&GrantFilter { user_id: Some(u.id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(grants[0].action, GrantAction::Deny);
    }

    #[tokio::test]
    async fn test_expired_assignment_ignored_and_swept() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let role = f.rbac.create_role(&ctx(), role_input("temp", &["geo:read"])).await.unwrap();
        let u = user(&f).await;

        // Write directly so the expiry can lie in the past
        let past = Utc::now() - ChronoDuration::minutes(5);
        f.repo
            .upsert_user_role(&UserRole::new(u.id, role.id).expires_at(Some(past)))
            .await
            .unwrap();
        assert!(!f.rbac.has_permission(u.id, "geo:read").await.unwrap());

        let report = f.rbac.expire_grants(Utc::now()).await.unwrap();
        assert_eq!(report.roles_expired, 1);
        assert!(f.repo.list_user_roles(u.id).await.unwrap().is_empty());

        let events = f.events.lock();
        assert!(events.iter().any(|e| e.event_type() == "rbac.user.grant_expired"));
    }

    #[tokio::test]
    async fn test_assignment_rejects_past_expiry() {
        let f = fixture();
        let role = f.rbac.create_role(&ctx(), role_input("temp", &[])).await.unwrap();
        let u = user(&f).await;
        let err = f
            .rbac
            .assign_role(&ctx(), u.id, role.id, Some(Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, DotMacError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_assignment_change() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let role = f.rbac.create_role(&ctx(), role_input("reader", &["users:read"])).await.unwrap();
        let u = user(&f).await;

        assert!(!f.rbac.has_permission(u.id, "users:read").await.unwrap());
        f.rbac.assign_role(&ctx(), u.id, role.id, None).await.unwrap();
        assert!(f.rbac.has_permission(u.id, "users:read").await.unwrap());
        f.rbac.revoke_role(&ctx(), u.id, role.id).await.unwrap();
        assert!(!f.rbac.has_permission(u.id, "users:read").await.unwrap());
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let f = fixture();
        let a = f.rbac.create_role(&ctx(), role_input("role-a", &[])).await.unwrap();
        let mut b = role_input("role-b", &[]);
        b.parent_id = Some(a.id);
        let b = f.rbac.create_role(&ctx(), b).await.unwrap();

        let err = f
            .rbac
            .update_role(&ctx(), a.id, UpdateRoleInput { parent_id: Some(Some(b.id)), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, DotMacError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let f = fixture();
        let mut parent = None;
        for name in ["lvl-1", "lvl-2", "lvl-3"] {
            let mut input = role_input(name, &[]);
            input.parent_id = parent;
            parent = Some(f.rbac.create_role(&ctx(), input).await.unwrap().id);
        }

        let mut too_deep = role_input("lvl-4", &[]);
        too_deep.parent_id = parent;
        let err = f.rbac.create_role(&ctx(), too_deep).await.unwrap_err();
        assert!(matches!(err, DotMacError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_system_roles_protected() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let admin = f.repo.find_role_by_name(None, system_roles::SUPER_ADMIN).await.unwrap().unwrap();

        assert!(matches!(
            f.rbac.delete_role(&ctx(), admin.id).await.unwrap_err(),
            DotMacError::Forbidden { .. }
        ));
        assert!(matches!(
            f.rbac.update_role(&ctx(), admin.id, UpdateRoleInput::default()).await.unwrap_err(),
            DotMacError::Forbidden { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_role_with_children_rejected() {
        let f = fixture();
        let parent = f.rbac.create_role(&ctx(), role_input("parent", &[])).await.unwrap();
        let mut child = role_input("child", &[]);
        child.parent_id = Some(parent.id);
        f.rbac.create_role(&ctx(), child).await.unwrap();

        assert!(matches!(
            f.rbac.delete_role(&ctx(), parent.id).await.unwrap_err(),
            DotMacError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_permission_rejected() {
        let f = fixture();
        let err = f
            .rbac
            .create_role(&ctx(), role_input("bad", &["made:up"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DotMacError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_max_users_enforced() {
        let f = fixture();
        let mut input = role_input("solo", &[]);
        input.max_users = Some(1);
        let role = f.rbac.create_role(&ctx(), input).await.unwrap();

        let first = user(&f).await;
        let second = user(&f).await;
        f.rbac.assign_role(&ctx(), first.id, role.id, None).await.unwrap();
        // Re-assigning the same user is allowed
        f.rbac.assign_role(&ctx(), first.id, role.id, None).await.unwrap();
        assert!(matches!(
            f.rbac.assign_role(&ctx(), second.id, role.id, None).await.unwrap_err(),
            DotMacError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_lapsed_members_do_not_fill_role() {
        let f = fixture();
        let mut input = role_input("solo", &[]);
        input.max_users = Some(1);
        let role = f.rbac.create_role(&ctx(), input).await.unwrap();

        let first = user(&f).await;
        let second = user(&f).await;
        let past = Utc::now() - ChronoDuration::minutes(1);
        f.repo
            .upsert_user_role(&UserRole::new(first.id, role.id).expires_at(Some(past)))
            .await
            .unwrap();

        f.rbac.assign_role(&ctx(), second.id, role.id, None).await.unwrap();
        // The lapsed holder now counts as a newcomer
        assert!(matches!(
            f.rbac.assign_role(&ctx(), first.id, role.id, None).await.unwrap_err(),
            DotMacError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_tenant_role_not_assignable_across_tenants() {
        let f = fixture();
        let mut input = role_input("local", &[]);
        input.tenant_id = Some(Uuid::new_v4());
        let role = f.rbac.create_role(&ctx(), input).await.unwrap();
        let u = user(&f).await;

        assert!(matches!(
            f.rbac.assign_role(&ctx(), u.id, role.id, None).await.unwrap_err(),
            DotMacError::Forbidden { .. }
        ));
    }

    #[tokio::test]
    async fn test_revocations_audited_under_user_tenant() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let role = f.rbac.create_role(&ctx(), role_input("reader", &["users:read"])).await.unwrap();
        let u = user(&f).await;

        // A platform operator acting from its own tenant
        let operator = ExecutionContext::for_principal(Uuid::new_v4(), Some(Uuid::new_v4()));
        f.rbac.assign_role(&operator, u.id, role.id, None).await.unwrap();
        f.rbac.revoke_role(&operator, u.id, role.id).await.unwrap();
        f.rbac
            .grant_user_permission(&operator, u.id, "geo:read", None, None)
            .await
            .unwrap();
        f.rbac.remove_user_permission(&operator, u.id, "geo:read").await.unwrap();

        let grants = f
            .rbac
            .list_grants(&GrantFilter { user_id: Some(u.id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(grants.len(), 4);
        assert!(grants.iter().all(|g| g.tenant_id == Some(u.tenant_id)));
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let f = fixture();
        let first = f.rbac.bootstrap_defaults().await.unwrap();
        assert_eq!(first.roles_created, 3);
        assert!(first.permissions_created > 0);

        let second = f.rbac.bootstrap_defaults().await.unwrap();
        assert_eq!(second, BootstrapReport::default());
    }

    #[tokio::test]
    async fn test_mutations_are_audited_and_published() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let role = f.rbac.create_role(&ctx(), role_input("ops", &["users:read"])).await.unwrap();
        f.rbac.grant_permission_to_role(&ctx(), role.id, "geo:read").await.unwrap();
        f.rbac.revoke_permission_from_role(&ctx(), role.id, "users:read").await.unwrap();

        let grants = f
            .rbac
            .list_grants(&GrantFilter { role_id: Some(role.id), ..Default::default() })
            .await
            .unwrap();
        let actions: Vec<GrantAction> = grants.iter().map(|g| g.action).collect();
        assert_eq!(actions, vec![GrantAction::Revoke, GrantAction::Grant, GrantAction::Grant]);

        let types: Vec<String> = f.events.lock().iter().map(|e| e.event_type().to_string()).collect();
        assert!(types.contains(&"rbac.role.created".to_string()));
        assert!(types.contains(&"rbac.role.permission_granted".to_string()));
        assert!(types.contains(&"rbac.role.permission_revoked".to_string()));
    }

    #[tokio::test]
    async fn test_resolution_racing_invalidation_not_cached() {
        let f = fixture();
        f.rbac.bootstrap_defaults().await.unwrap();
        let u = user(&f).await;
        let stale = Arc::new(EffectivePermissions { user_id: u.id, ..Default::default() });

        // Resolution started, then the user's grants changed
        let stamp = f.rbac.stamp(u.id);
        f.rbac.invalidate_user(u.id);
        f.rbac.cache_resolved(u.id, stamp, stale.clone());
        assert!(f.rbac.cache.get(&u.id).is_none());

        let stamp = f.rbac.stamp(u.id);
        f.rbac.invalidate_all();
        f.rbac.cache_resolved(u.id, stamp, stale.clone());
        assert!(f.rbac.cache.get(&u.id).is_none());

        let stamp = f.rbac.stamp(u.id);
        f.rbac.cache_resolved(u.id, stamp, stale);
        assert!(f.rbac.cache.get(&u.id).is_some());
    }

    #[test]
    fn test_effective_permissions_allows() {
        let mut eff = EffectivePermissions::default();
        eff.granted.insert("users:*".into());
        eff.denied.insert("users:delete".into());

        assert!(eff.allows("users:read"));
        assert!(!eff.allows("users:delete"));
        assert!(!eff.allows("geo:read"));
        assert!(!eff.is_superuser());
    }
}
