//! Repositories
//!
//! Storage traits for the RBAC schema and users, with an in-memory
//! implementation and a PostgreSQL implementation.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{GrantFilter, Permission, PermissionGrant, Role, User, UserPermission, UserRole};
use crate::error::Result;

pub use memory::{MemoryRbacRepository, MemoryUserRepository};
pub use postgres::{init_schema, PgRbacRepository, PgUserRepository};

#[async_trait]
pub trait RbacRepository: Send + Sync {
    // Permissions

    async fn insert_permission(&self, permission: &Permission) -> Result<()>;

    async fn find_permission(&self, name: &str) -> Result<Option<Permission>>;

    async fn list_permissions(&self, category: Option<&str>) -> Result<Vec<Permission>>;

    // Roles

    async fn insert_role(&self, role: &Role) -> Result<()>;

    async fn update_role(&self, role: &Role) -> Result<()>;

    async fn delete_role(&self, id: Uuid) -> Result<bool>;

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>>;

    /// `tenant_id = None` looks among global roles only
    async fn find_role_by_name(&self, tenant_id: Option<Uuid>, name: &str) -> Result<Option<Role>>;

    /// Roles of the tenant plus global roles; `None` lists every role
    async fn list_roles(&self, tenant_id: Option<Uuid>) -> Result<Vec<Role>>;

    async fn list_child_roles(&self, parent_id: Uuid) -> Result<Vec<Role>>;

    /// Assignments of the role that have not lapsed at `now`
    async fn count_role_members(&self, role_id: Uuid, now: DateTime<Utc>) -> Result<i64>;

    // Role assignments

    async fn upsert_user_role(&self, assignment: &UserRole) -> Result<()>;

    async fn delete_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool>;

    async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>>;

    /// Remove assignments with `expires_at <= now`, returning them
    async fn delete_expired_user_roles(&self, now: DateTime<Utc>) -> Result<Vec<UserRole>>;

    // Direct overrides

    async fn upsert_user_permission(&self, grant: &UserPermission) -> Result<()>;

    async fn delete_user_permission(&self, user_id: Uuid, permission: &str) -> Result<bool>;

    async fn list_user_permissions(&self, user_id: Uuid) -> Result<Vec<UserPermission>>;

    async fn delete_expired_user_permissions(&self, now: DateTime<Utc>) -> Result<Vec<UserPermission>>;

    // Audit trail

    async fn insert_grant(&self, grant: &PermissionGrant) -> Result<()>;

    /// Newest first
    async fn list_grants(&self, filter: &GrantFilter) -> Result<Vec<PermissionGrant>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert(&self, user: &User) -> Result<()>;

    async fn update(&self, user: &User) -> Result<()>;

    async fn delete(&self, id: Uuid) -> Result<bool>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    async fn find_by_username(&self, tenant_id: Uuid, username: &str) -> Result<Option<User>>;

    /// Case-insensitive
    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> Result<Option<User>>;

    /// Page of users ordered by creation time, plus the tenant total
    async fn list(&self, tenant_id: Uuid, offset: i64, limit: i64) -> Result<(Vec<User>, i64)>;
}
