//! Role assignments, direct permission overrides and the grant audit trail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row of the `user_roles` association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRole {
    pub user_id: Uuid,
    pub role_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<Uuid>,
    pub granted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRole {
    pub fn new(user_id: Uuid, role_id: Uuid) -> Self {
        Self {
            user_id,
            role_id,
            granted_by: None,
            granted_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn granted_by(mut self, principal: Option<Uuid>) -> Self {
        self.granted_by = principal;
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |e| e > now)
    }
}

/// Direct user permission override. `granted = false` is an explicit deny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub user_id: Uuid,
    pub permission: String,
    pub granted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub granted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserPermission {
    pub fn allow(user_id: Uuid, permission: impl Into<String>) -> Self {
        Self::new(user_id, permission, true)
    }

    pub fn deny(user_id: Uuid, permission: impl Into<String>) -> Self {
        Self::new(user_id, permission, false)
    }

    fn new(user_id: Uuid, permission: impl Into<String>, granted: bool) -> Self {
        Self {
            user_id,
            permission: permission.into(),
            granted,
            granted_by: None,
            reason: None,
            granted_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn granted_by(mut self, principal: Option<Uuid>) -> Self {
        self.granted_by = principal;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |e| e > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantAction {
    Grant,
    /// Explicit deny override
    Deny,
    Revoke,
    Expire,
    RoleAssign,
    RoleRevoke,
}

impl GrantAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "GRANT",
            Self::Deny => "DENY",
            Self::Revoke => "REVOKE",
            Self::Expire => "EXPIRE",
            Self::RoleAssign => "ROLE_ASSIGN",
            Self::RoleRevoke => "ROLE_REVOKE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GRANT" => Some(Self::Grant),
            "DENY" => Some(Self::Deny),
            "REVOKE" => Some(Self::Revoke),
            "EXPIRE" => Some(Self::Expire),
            "ROLE_ASSIGN" => Some(Self::RoleAssign),
            "ROLE_REVOKE" => Some(Self::RoleRevoke),
            _ => None,
        }
    }
}

/// Append-only audit row for every permission/role change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionGrant {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<String>,
    pub action: GrantAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performed_by: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PermissionGrant {
    pub fn new(action: GrantAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            user_id: None,
            role_id: None,
            permission: None,
            action,
            performed_by: None,
            reason: None,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn role(mut self, role_id: Uuid) -> Self {
        self.role_id = Some(role_id);
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn performed_by(mut self, principal: Option<Uuid>) -> Self {
        self.performed_by = principal;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    pub fn expires_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }
}

/// Filter for listing the grant audit trail
#[derive(Debug, Clone, Default)]
pub struct GrantFilter {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_assignment_expiry() {
        let now = Utc::now();
        let permanent = UserRole::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(permanent.is_active(now));

        let temporary = UserRole::new(Uuid::new_v4(), Uuid::new_v4())
            .expires_at(Some(now + Duration::hours(1)));
        assert!(temporary.is_active(now));
        assert!(!temporary.is_active(now + Duration::hours(2)));
    }

    #[test]
    fn test_override_kinds() {
        let user = Uuid::new_v4();
        assert!(UserPermission::allow(user, "users:read").granted);
        assert!(!UserPermission::deny(user, "users:read").granted);
    }

    #[test]
    fn test_grant_action_round_trip() {
        for action in [
            GrantAction::Grant,
            GrantAction::Deny,
            GrantAction::Revoke,
            GrantAction::Expire,
            GrantAction::RoleAssign,
            GrantAction::RoleRevoke,
        ] {
            assert_eq!(GrantAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(GrantAction::parse("nope"), None);
    }
}
