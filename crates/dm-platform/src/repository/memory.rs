//! In-memory repositories for tests and single-node development

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::{
    normalize_email, GrantFilter, Permission, PermissionGrant, Role, User, UserPermission, UserRole,
};
use crate::error::{DotMacError, Result};
use crate::repository::{RbacRepository, UserRepository};

#[derive(Default)]
pub struct MemoryRbacRepository {
    permissions: DashMap<String, Permission>,
    roles: RwLock<HashMap<Uuid, Role>>,
    user_roles: DashMap<(Uuid, Uuid), UserRole>,
    user_permissions: DashMap<(Uuid, String), UserPermission>,
    grants: RwLock<Vec<PermissionGrant>>,
}

impl MemoryRbacRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn name_taken(roles: &HashMap<Uuid, Role>, role: &Role) -> bool {
    roles
        .values()
        .any(|r| r.id != role.id && r.tenant_id == role.tenant_id && r.name == role.name)
}

#[async_trait]
impl RbacRepository for MemoryRbacRepository {
    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.permissions.entry(permission.name.clone()) {
            Entry::Occupied(_) => Err(DotMacError::duplicate("Permission", "name", &permission.name)),
            Entry::Vacant(slot) => {
                slot.insert(permission.clone());
                Ok(())
            }
        }
    }

    async fn find_permission(&self, name: &str) -> Result<Option<Permission>> {
        Ok(self.permissions.get(name).map(|p| p.clone()))
    }

    async fn list_permissions(&self, category: Option<&str>) -> Result<Vec<Permission>> {
        let mut permissions: Vec<Permission> = self
            .permissions
            .iter()
            .filter(|p| category.map_or(true, |c| p.category.as_deref() == Some(c)))
            .map(|p| p.clone())
            .collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(permissions)
    }

    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut roles = self.roles.write();
        if name_taken(&roles, role) {
            return Err(DotMacError::duplicate("Role", "name", &role.name));
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn update_role(&self, role: &Role) -> Result<()> {
        let mut roles = self.roles.write();
        if !roles.contains_key(&role.id) {
            return Err(DotMacError::not_found("Role", role.id));
        }
        if name_taken(&roles, role) {
            return Err(DotMacError::duplicate("Role", "name", &role.name));
        }
        roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn delete_role(&self, id: Uuid) -> Result<bool> {
        let removed = self.roles.write().remove(&id).is_some();
        if removed {
            self.user_roles.retain(|(_, role_id), _| *role_id != id);
        }
        Ok(removed)
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        Ok(self.roles.read().get(&id).cloned())
    }

    async fn find_role_by_name(&self, tenant_id: Option<Uuid>, name: &str) -> Result<Option<Role>> {
        Ok(self
            .roles
            .read()
            .values()
            .find(|r| r.tenant_id == tenant_id && r.name == name)
            .cloned())
    }

    async fn list_roles(&self, tenant_id: Option<Uuid>) -> Result<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .values()
            .filter(|r| match tenant_id {
                Some(t) => r.visible_to(t),
                None => true,
            })
            .cloned()
            .collect();
        roles.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(roles)
    }

    async fn list_child_roles(&self, parent_id: Uuid) -> Result<Vec<Role>> {
        Ok(self
            .roles
            .read()
            .values()
            .filter(|r| r.parent_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn count_role_members(&self, role_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .user_roles
            .iter()
            .filter(|e| e.key().1 == role_id && e.value().is_active(now))
            .count() as i64)
    }

    async fn upsert_user_role(&self, assignment: &UserRole) -> Result<()> {
        self.user_roles
            .insert((assignment.user_id, assignment.role_id), assignment.clone());
        Ok(())
    }

    async fn delete_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        Ok(self.user_roles.remove(&(user_id, role_id)).is_some())
    }

    async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        let mut assignments: Vec<UserRole> = self
            .user_roles
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.value().clone())
            .collect();
        assignments.sort_by_key(|a| a.granted_at);
        Ok(assignments)
    }

    async fn delete_expired_user_roles(&self, now: DateTime<Utc>) -> Result<Vec<UserRole>> {
        let expired: Vec<(Uuid, Uuid)> = self
            .user_roles
            .iter()
            .filter(|e| !e.value().is_active(now))
            .map(|e| *e.key())
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|key| self.user_roles.remove(&key).map(|(_, v)| v))
            .collect())
    }

    async fn upsert_user_permission(&self, grant: &UserPermission) -> Result<()> {
        self.user_permissions
            .insert((grant.user_id, grant.permission.clone()), grant.clone());
        Ok(())
    }

    async fn delete_user_permission(&self, user_id: Uuid, permission: &str) -> Result<bool> {
        Ok(self
            .user_permissions
            .remove(&(user_id, permission.to_string()))
            .is_some())
    }

    async fn list_user_permissions(&self, user_id: Uuid) -> Result<Vec<UserPermission>> {
        let mut grants: Vec<UserPermission> = self
            .user_permissions
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| e.value().clone())
            .collect();
        grants.sort_by(|a, b| a.permission.cmp(&b.permission));
        Ok(grants)
    }

    async fn delete_expired_user_permissions(&self, now: DateTime<Utc>) -> Result<Vec<UserPermission>> {
        let expired: Vec<(Uuid, String)> = self
            .user_permissions
            .iter()
            .filter(|e| !e.value().is_active(now))
            .map(|e| e.key().clone())
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|key| self.user_permissions.remove(&key).map(|(_, v)| v))
            .collect())
    }

    async fn insert_grant(&self, grant: &PermissionGrant) -> Result<()> {
        self.grants.write().push(grant.clone());
        Ok(())
    }

    async fn list_grants(&self, filter: &GrantFilter) -> Result<Vec<PermissionGrant>> {
        let grants = self.grants.read();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit as usize };
        Ok(grants
            .iter()
            .rev()
            .filter(|g| filter.tenant_id.map_or(true, |t| g.tenant_id == Some(t)))
            .filter(|g| filter.user_id.map_or(true, |u| g.user_id == Some(u)))
            .filter(|g| filter.role_id.map_or(true, |r| g.role_id == Some(r)))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryUserRepository {
    users: RwLock<HashMap<Uuid, User>>,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_unique(users: &HashMap<Uuid, User>, user: &User) -> Result<()> {
        for other in users.values() {
            if other.id == user.id || other.tenant_id != user.tenant_id {
                continue;
            }
            if other.username == user.username {
                return Err(DotMacError::duplicate("User", "username", &user.username));
            }
            if other.email == user.email {
                return Err(DotMacError::duplicate("User", "email", &user.email));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    async fn insert(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(DotMacError::duplicate("User", "id", user.id.to_string()));
        }
        Self::check_unique(&users, user)?;
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if !users.contains_key(&user.id) {
            return Err(DotMacError::not_found("User", user.id));
        }
        Self::check_unique(&users, user)?;
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.users.write().remove(&id).is_some())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.read().get(&id).cloned())
    }

    async fn find_by_username(&self, tenant_id: Uuid, username: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.tenant_id == tenant_id && u.username == username)
            .cloned())
    }

    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> Result<Option<User>> {
        let email = normalize_email(email);
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.tenant_id == tenant_id && u.email == email)
            .cloned())
    }

    async fn list(&self, tenant_id: Uuid, offset: i64, limit: i64) -> Result<(Vec<User>, i64)> {
        let users = self.users.read();
        let mut matching: Vec<&User> = users.values().filter(|u| u.tenant_id == tenant_id).collect();
        matching.sort_by_key(|u| u.created_at);
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok((page, total))
    }
}
