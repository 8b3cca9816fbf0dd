//! Role Entity
//!
//! Roles bundle permissions and may inherit from a parent role. A role
//! without a tenant is global and visible to every tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::permission::permission_matches;
use crate::error::{DotMacError, Result};
use crate::events::{AggregateRoot, EventEnvelope};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,

    /// `None` for global roles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,

    /// Unique within the tenant (or among global roles)
    pub name: String,

    pub display_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Role whose permissions are inherited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,

    /// Higher wins when roles are listed
    pub priority: i32,

    /// Seeded by the platform; cannot be deleted, renamed or re-parented
    pub is_system: bool,

    pub is_active: bool,

    /// Assigned to every newly registered user
    pub is_default: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_users: Option<i32>,

    #[serde(default)]
    pub permissions: BTreeSet<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    pending_events: Vec<EventEnvelope>,
}

impl Role {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            parent_id: None,
            priority: 0,
            is_system: false,
            is_active: true,
            is_default: false,
            max_users: None,
            permissions: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            pending_events: Vec::new(),
        }
    }

    pub fn for_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_permissions(mut self, permissions: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn with_max_users(mut self, max_users: i32) -> Self {
        self.max_users = Some(max_users);
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    pub fn default_role(mut self) -> Self {
        self.is_default = true;
        self
    }

    /// Returns true when the permission was not already present
    pub fn grant_permission(&mut self, permission: impl Into<String>) -> bool {
        let added = self.permissions.insert(permission.into());
        if added {
            self.updated_at = Utc::now();
        }
        added
    }

    /// Returns true when the permission was present
    pub fn revoke_permission(&mut self, permission: &str) -> bool {
        let removed = self.permissions.remove(permission);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Direct permissions only; inheritance is resolved by the RBAC service
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| permission_matches(p, permission))
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id.is_none()
    }

    /// Global roles are visible to everyone, tenant roles only to their tenant
    pub fn visible_to(&self, tenant_id: Uuid) -> bool {
        self.tenant_id.map_or(true, |t| t == tenant_id)
    }

    pub fn can_modify(&self) -> bool {
        !self.is_system
    }
}

impl AggregateRoot for Role {
    fn aggregate_type() -> &'static str {
        "role"
    }

    fn pending_events(&mut self) -> &mut Vec<EventEnvelope> {
        &mut self.pending_events
    }
}

/// Validate a role name: 2-64 chars of `[a-z0-9_-]`
pub fn validate_role_name(name: &str) -> Result<()> {
    let valid = (2..=64).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DotMacError::field(
            "name",
            format!("Role name '{}' must be 2-64 characters of a-z, 0-9, '_' or '-'", name),
        ))
    }
}

/// Names of the roles seeded by the platform
pub mod system_roles {
    pub const SUPER_ADMIN: &str = "super_admin";
    pub const TENANT_ADMIN: &str = "tenant_admin";
    pub const USER: &str = "user";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_matching() {
        let role = Role::new("ops", "Operations")
            .with_permission("users:read")
            .with_permission("geo:*");

        assert!(role.has_permission("users:read"));
        assert!(!role.has_permission("users:write"));
        assert!(role.has_permission("geo:read"));
    }

    #[test]
    fn test_grant_and_revoke() {
        let mut role = Role::new("ops", "Operations");
        assert!(role.grant_permission("users:read"));
        assert!(!role.grant_permission("users:read"));
        assert!(role.revoke_permission("users:read"));
        assert!(!role.revoke_permission("users:read"));
    }

    #[test]
    fn test_visibility() {
        let tenant = Uuid::new_v4();
        let other = Uuid::new_v4();

        let global = Role::new("auditor", "Auditor");
        assert!(global.is_global());
        assert!(global.visible_to(tenant));

        let scoped = Role::new("auditor", "Auditor").for_tenant(tenant);
        assert!(scoped.visible_to(tenant));
        assert!(!scoped.visible_to(other));
    }

    #[test]
    fn test_system_roles_cannot_be_modified() {
        assert!(!Role::new("super_admin", "Super Admin").system().can_modify());
        assert!(Role::new("custom", "Custom").can_modify());
    }

    #[test]
    fn test_role_name_validation() {
        assert!(validate_role_name("tenant_admin").is_ok());
        assert!(validate_role_name("billing-viewer").is_ok());
        assert!(validate_role_name("a").is_err());
        assert!(validate_role_name("Admin").is_err());
        assert!(validate_role_name("has space").is_err());
    }
}
