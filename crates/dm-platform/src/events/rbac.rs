//! RBAC Domain Events

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::Role;
use crate::events::{EventMetadata, ExecutionContext};
use crate::impl_domain_event;

/// Event emitted when a role is created.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleCreated {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub role_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

impl_domain_event!(RoleCreated);

impl RoleCreated {
    pub const EVENT_TYPE: &'static str = "rbac.role.created";

    pub fn new(ctx: &ExecutionContext, role: &Role) -> Self {
        Self {
            metadata: role_metadata(ctx, Self::EVENT_TYPE, role),
            role_id: role.id,
            name: role.name.clone(),
            parent_id: role.parent_id,
            permissions: role.permissions.iter().cloned().collect(),
        }
    }
}

/// Event emitted when role attributes change.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleUpdated {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub role_id: Uuid,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub is_active: bool,
}

impl_domain_event!(RoleUpdated);

impl RoleUpdated {
    pub const EVENT_TYPE: &'static str = "rbac.role.updated";

    pub fn new(ctx: &ExecutionContext, role: &Role) -> Self {
        Self {
            metadata: role_metadata(ctx, Self::EVENT_TYPE, role),
            role_id: role.id,
            name: role.name.clone(),
            parent_id: role.parent_id,
            is_active: role.is_active,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDeleted {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub role_id: Uuid,
    pub name: String,
}

impl_domain_event!(RoleDeleted);

impl RoleDeleted {
    pub const EVENT_TYPE: &'static str = "rbac.role.deleted";

    pub fn new(ctx: &ExecutionContext, role: &Role) -> Self {
        Self {
            metadata: role_metadata(ctx, Self::EVENT_TYPE, role),
            role_id: role.id,
            name: role.name.clone(),
        }
    }
}

/// Event emitted when a permission is added to a role.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionGranted {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub role_id: Uuid,
    pub permission: String,
}

impl_domain_event!(RolePermissionGranted);

impl RolePermissionGranted {
    pub const EVENT_TYPE: &'static str = "rbac.role.permission_granted";

    pub fn new(ctx: &ExecutionContext, role: &Role, permission: &str) -> Self {
        Self {
            metadata: role_metadata(ctx, Self::EVENT_TYPE, role),
            role_id: role.id,
            permission: permission.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermissionRevoked {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub role_id: Uuid,
    pub permission: String,
}

impl_domain_event!(RolePermissionRevoked);

impl RolePermissionRevoked {
    pub const EVENT_TYPE: &'static str = "rbac.role.permission_revoked";

    pub fn new(ctx: &ExecutionContext, role: &Role, permission: &str) -> Self {
        Self {
            metadata: role_metadata(ctx, Self::EVENT_TYPE, role),
            role_id: role.id,
            permission: permission.to_string(),
        }
    }
}

/// Event emitted when a role is assigned to a user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleAssigned {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl_domain_event!(UserRoleAssigned);

impl UserRoleAssigned {
    pub const EVENT_TYPE: &'static str = "rbac.user.role_assigned";

    pub fn new(
        ctx: &ExecutionContext,
        user_id: Uuid,
        role: &Role,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            role_id: role.id,
            role_name: role.name.clone(),
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleRevoked {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub role_id: Uuid,
}

impl_domain_event!(UserRoleRevoked);

impl UserRoleRevoked {
    pub const EVENT_TYPE: &'static str = "rbac.user.role_revoked";

    pub fn new(ctx: &ExecutionContext, user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            role_id,
        }
    }
}

/// Event emitted when a direct allow or deny override is set on a user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionGranted {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub permission: String,
    /// false for an explicit deny
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl_domain_event!(UserPermissionGranted);

impl UserPermissionGranted {
    pub const EVENT_TYPE: &'static str = "rbac.user.permission_granted";

    pub fn new(
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
        granted: bool,
        reason: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            permission: permission.to_string(),
            granted,
            reason,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionRevoked {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub permission: String,
}

impl_domain_event!(UserPermissionRevoked);

impl UserPermissionRevoked {
    pub const EVENT_TYPE: &'static str = "rbac.user.permission_revoked";

    pub fn new(ctx: &ExecutionContext, user_id: Uuid, permission: &str) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            permission: permission.to_string(),
        }
    }
}

/// Event emitted by the expiry sweep for each lapsed assignment or override.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGrantExpired {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    pub expired_at: DateTime<Utc>,
}

impl_domain_event!(UserGrantExpired);

impl UserGrantExpired {
    pub const EVENT_TYPE: &'static str = "rbac.user.grant_expired";

    pub fn role(ctx: &ExecutionContext, user_id: Uuid, role_id: Uuid, expired_at: DateTime<Utc>) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            role_id: Some(role_id),
            permission: None,
            expired_at,
        }
    }

    pub fn permission(
        ctx: &ExecutionContext,
        user_id: Uuid,
        permission: &str,
        expired_at: DateTime<Utc>,
    ) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user_id),
            user_id,
            role_id: None,
            permission: Some(permission.to_string()),
            expired_at,
        }
    }
}

fn role_metadata(ctx: &ExecutionContext, event_type: &str, role: &Role) -> EventMetadata {
    let mut metadata = EventMetadata::new(ctx, event_type, "role", role.id);
    if metadata.tenant_id.is_none() {
        metadata.tenant_id = role.tenant_id;
    }
    metadata
}

fn user_metadata(ctx: &ExecutionContext, event_type: &str, user_id: Uuid) -> EventMetadata {
    EventMetadata::new(ctx, event_type, "user", user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEvent;

    #[test]
    fn test_role_created_event() {
        let tenant = Uuid::new_v4();
        let role = Role::new("ops", "Operations")
            .for_tenant(tenant)
            .with_permission("users:read");
        let event = RoleCreated::new(&ExecutionContext::system(), &role);

        assert_eq!(event.event_type(), "rbac.role.created");
        assert_eq!(event.aggregate_id(), role.id.to_string());
        assert_eq!(event.tenant_id(), Some(tenant));
        assert_eq!(event.payload()["permissions"][0], "users:read");
    }

    #[test]
    fn test_user_grant_expired_variants() {
        let user = Uuid::new_v4();
        let now = Utc::now();
        let ctx = ExecutionContext::system();

        let role_event = UserGrantExpired::role(&ctx, user, Uuid::new_v4(), now);
        assert!(role_event.payload().get("permission").is_none());

        let perm_event = UserGrantExpired::permission(&ctx, user, "geo:read", now);
        assert_eq!(perm_event.payload()["permission"], "geo:read");
        assert_eq!(perm_event.metadata.aggregate_type, "user");
    }
}
