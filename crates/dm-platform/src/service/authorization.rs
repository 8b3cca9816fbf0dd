//! Authorization context of an authenticated request

use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{permission_matches, WILDCARD};
use crate::error::{DotMacError, Result};
use crate::events::ExecutionContext;
use crate::service::rbac::EffectivePermissions;

/// Built from a verified access token with permissions resolved
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub roles: Vec<String>,
    pub session_id: String,
    /// jti of the access token, used for logout
    pub token_id: String,
    pub token_expires_at: i64,
    pub permissions: Arc<EffectivePermissions>,
}

impl AuthContext {
    pub fn has(&self, permission: &str) -> bool {
        self.permissions.allows(permission)
    }

    pub fn require(&self, permission: &str) -> Result<()> {
        if self.has(permission) {
            Ok(())
        } else {
            tracing::debug!(user_id = %self.user_id, permission, "Permission denied");
            Err(DotMacError::permission_denied(permission))
        }
    }

    pub fn require_any(&self, permissions: &[&str]) -> Result<()> {
        if permissions.iter().any(|p| self.has(p)) {
            Ok(())
        } else {
            Err(DotMacError::permission_denied(permissions.join(" | ")))
        }
    }

    /// Holders of `*` act across tenants
    pub fn is_superuser(&self) -> bool {
        self.permissions.is_superuser()
    }

    pub fn can_access_tenant(&self, tenant_id: Uuid) -> bool {
        self.tenant_id == tenant_id || self.is_superuser()
    }

    pub fn ensure_tenant(&self, tenant_id: Uuid) -> Result<()> {
        if self.can_access_tenant(tenant_id) {
            Ok(())
        } else {
            Err(DotMacError::forbidden("Resource belongs to another tenant"))
        }
    }

    /// Non-superusers may only hand out permissions they hold themselves.
    /// A pattern is only delegable when none of the caller's denials fall under it.
    pub fn ensure_can_delegate<'a>(&self, permissions: impl IntoIterator<Item = &'a str>) -> Result<()> {
        if self.is_superuser() {
            return Ok(());
        }
        for permission in permissions {
            let covered = !permission.starts_with(WILDCARD)
                && self.has(permission)
                && !self.permissions.denied.iter().any(|d| permission_matches(permission, d));
            if !covered {
                tracing::warn!(
                    user_id = %self.user_id,
                    permission,
                    "Delegation beyond own permissions refused"
                );
                return Err(DotMacError::forbidden(format!(
                    "Cannot delegate permission '{}' the caller does not hold",
                    permission
                )));
            }
        }
        Ok(())
    }

    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::for_principal(self.user_id, Some(self.tenant_id))
    }
}

#[cfg(test)]
pub(crate) fn test_context(tenant_id: Uuid, granted: &[&str]) -> AuthContext {
    let mut permissions = EffectivePermissions::default();
    permissions.granted.extend(granted.iter().map(|p| p.to_string()));
    AuthContext {
        user_id: Uuid::new_v4(),
        tenant_id,
        email: "test@example.com".to_string(),
        roles: Vec::new(),
        session_id: "s".to_string(),
        token_id: "t".to_string(),
        token_expires_at: 0,
        permissions: Arc::new(permissions),
    }
}
