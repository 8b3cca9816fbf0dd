//! PostgreSQL repositories

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use crate::domain::{
    normalize_email, GrantAction, GrantFilter, Permission, PermissionGrant, Role, User,
    UserPermission, UserRole,
};
use crate::error::{DotMacError, Result};
use crate::repository::{RbacRepository, UserRepository};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS permissions (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        display_name TEXT NOT NULL,
        description TEXT,
        category TEXT,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_system BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS roles (
        id UUID PRIMARY KEY,
        tenant_id UUID,
        name TEXT NOT NULL,
        display_name TEXT NOT NULL,
        description TEXT,
        parent_id UUID REFERENCES roles(id) ON DELETE RESTRICT,
        priority INTEGER NOT NULL DEFAULT 0,
        is_system BOOLEAN NOT NULL DEFAULT FALSE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_default BOOLEAN NOT NULL DEFAULT FALSE,
        max_users INTEGER,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    // Global roles have no tenant; coalesce so their names are unique too
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_roles_tenant_name
        ON roles (COALESCE(tenant_id, '00000000-0000-0000-0000-000000000000'::uuid), name)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_permissions (
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        PRIMARY KEY (role_id, permission)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        tenant_id UUID NOT NULL,
        username TEXT NOT NULL,
        email TEXT NOT NULL,
        full_name TEXT,
        password_hash TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        is_verified BOOLEAN NOT NULL DEFAULT FALSE,
        mfa_enabled BOOLEAN NOT NULL DEFAULT FALSE,
        mfa_secret TEXT,
        backup_code_hashes TEXT[] NOT NULL DEFAULT '{}',
        failed_login_attempts INTEGER NOT NULL DEFAULT 0,
        locked_until TIMESTAMPTZ,
        last_login_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT uq_users_tenant_username UNIQUE (tenant_id, username),
        CONSTRAINT uq_users_tenant_email UNIQUE (tenant_id, email)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_roles (
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        granted_by UUID,
        granted_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ,
        PRIMARY KEY (user_id, role_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_roles_expires ON user_roles(expires_at) WHERE expires_at IS NOT NULL",
    r#"
    CREATE TABLE IF NOT EXISTS user_permissions (
        user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        permission TEXT NOT NULL,
        granted BOOLEAN NOT NULL,
        granted_by UUID,
        reason TEXT,
        granted_at TIMESTAMPTZ NOT NULL,
        expires_at TIMESTAMPTZ,
        PRIMARY KEY (user_id, permission)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_user_permissions_expires ON user_permissions(expires_at) WHERE expires_at IS NOT NULL",
    r#"
    CREATE TABLE IF NOT EXISTS permission_grants (
        id UUID PRIMARY KEY,
        tenant_id UUID,
        user_id UUID,
        role_id UUID,
        permission TEXT,
        action TEXT NOT NULL,
        performed_by UUID,
        reason TEXT,
        expires_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_permission_grants_user ON permission_grants(user_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_permission_grants_role ON permission_grants(role_id, created_at DESC)",
];

/// Create tables, constraints and indexes if they do not exist
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Database schema initialized");
    Ok(())
}

/// Map a unique violation to `Duplicate`, keeping every other error as is
fn map_unique(e: sqlx::Error, entity_type: &str, field: &str, value: &str) -> DotMacError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            let field = match db.constraint() {
                Some("uq_users_tenant_username") => "username",
                Some("uq_users_tenant_email") => "email",
                _ => field,
            };
            return DotMacError::duplicate(entity_type, field, value);
        }
    }
    DotMacError::Database(e)
}

#[derive(Debug, FromRow)]
struct PermissionRow {
    id: Uuid,
    name: String,
    display_name: String,
    description: Option<String>,
    category: Option<String>,
    is_active: bool,
    is_system: bool,
    created_at: DateTime<Utc>,
}

impl From<PermissionRow> for Permission {
    fn from(row: PermissionRow) -> Self {
        Permission {
            id: row.id,
            name: row.name,
            display_name: row.display_name,
            description: row.description,
            category: row.category,
            is_active: row.is_active,
            is_system: row.is_system,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct RoleRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    name: String,
    display_name: String,
    description: Option<String>,
    parent_id: Option<Uuid>,
    priority: i32,
    is_system: bool,
    is_active: bool,
    is_default: bool,
    max_users: Option<i32>,
    permissions: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        let mut role = Role::new(row.name, row.display_name).with_permissions(row.permissions);
        role.id = row.id;
        role.tenant_id = row.tenant_id;
        role.description = row.description;
        role.parent_id = row.parent_id;
        role.priority = row.priority;
        role.is_system = row.is_system;
        role.is_active = row.is_active;
        role.is_default = row.is_default;
        role.max_users = row.max_users;
        role.created_at = row.created_at;
        role.updated_at = row.updated_at;
        role
    }
}

const ROLE_SELECT: &str = r#"
    SELECT r.id, r.tenant_id, r.name, r.display_name, r.description, r.parent_id,
           r.priority, r.is_system, r.is_active, r.is_default, r.max_users,
           COALESCE(array_agg(rp.permission ORDER BY rp.permission)
                    FILTER (WHERE rp.permission IS NOT NULL), '{}') AS permissions,
           r.created_at, r.updated_at
    FROM roles r
    LEFT JOIN role_permissions rp ON rp.role_id = r.id
"#;

#[derive(Debug, FromRow)]
struct UserRoleRow {
    user_id: Uuid,
    role_id: Uuid,
    granted_by: Option<Uuid>,
    granted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<UserRoleRow> for UserRole {
    fn from(row: UserRoleRow) -> Self {
        UserRole {
            user_id: row.user_id,
            role_id: row.role_id,
            granted_by: row.granted_by,
            granted_at: row.granted_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct UserPermissionRow {
    user_id: Uuid,
    permission: String,
    granted: bool,
    granted_by: Option<Uuid>,
    reason: Option<String>,
    granted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl From<UserPermissionRow> for UserPermission {
    fn from(row: UserPermissionRow) -> Self {
        UserPermission {
            user_id: row.user_id,
            permission: row.permission,
            granted: row.granted,
            granted_by: row.granted_by,
            reason: row.reason,
            granted_at: row.granted_at,
            expires_at: row.expires_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct GrantRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    user_id: Option<Uuid>,
    role_id: Option<Uuid>,
    permission: Option<String>,
    action: String,
    performed_by: Option<Uuid>,
    reason: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for PermissionGrant {
    type Error = DotMacError;

    fn try_from(row: GrantRow) -> Result<Self> {
        let action = GrantAction::parse(&row.action)
            .ok_or_else(|| DotMacError::internal(format!("Unknown grant action '{}'", row.action)))?;
        Ok(PermissionGrant {
            id: row.id,
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            role_id: row.role_id,
            permission: row.permission,
            action,
            performed_by: row.performed_by,
            reason: row.reason,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Clone)]
pub struct PgRbacRepository {
    pool: PgPool,
}

impl PgRbacRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_role_permissions(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        role: &Role,
    ) -> Result<()> {
        sqlx::query("DELETE FROM role_permissions WHERE role_id = $1")
            .bind(role.id)
            .execute(&mut **tx)
            .await?;
        let permissions: Vec<String> = role.permissions.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission) SELECT $1, unnest($2::text[])",
        )
        .bind(role.id)
        .bind(&permissions)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RbacRepository for PgRbacRepository {
    async fn insert_permission(&self, permission: &Permission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, name, display_name, description, category, is_active, is_system, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(permission.id)
        .bind(&permission.name)
        .bind(&permission.display_name)
        .bind(&permission.description)
        .bind(&permission.category)
        .bind(permission.is_active)
        .bind(permission.is_system)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "Permission", "name", &permission.name))?;
        Ok(())
    }

    async fn find_permission(&self, name: &str) -> Result<Option<Permission>> {
        let row = sqlx::query_as::<_, PermissionRow>("SELECT * FROM permissions WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_permissions(&self, category: Option<&str>) -> Result<Vec<Permission>> {
        let rows = sqlx::query_as::<_, PermissionRow>(
            "SELECT * FROM permissions WHERE ($1::text IS NULL OR category = $1) ORDER BY name",
        )
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO roles (id, tenant_id, name, display_name, description, parent_id, priority,
                               is_system, is_active, is_default, max_users, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(role.id)
        .bind(role.tenant_id)
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(role.parent_id)
        .bind(role.priority)
        .bind(role.is_system)
        .bind(role.is_active)
        .bind(role.is_default)
        .bind(role.max_users)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique(e, "Role", "name", &role.name))?;

        Self::write_role_permissions(&mut tx, role).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE roles SET name = $2, display_name = $3, description = $4, parent_id = $5,
                priority = $6, is_active = $7, is_default = $8, max_users = $9, updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.display_name)
        .bind(&role.description)
        .bind(role.parent_id)
        .bind(role.priority)
        .bind(role.is_active)
        .bind(role.is_default)
        .bind(role.max_users)
        .bind(role.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_unique(e, "Role", "name", &role.name))?;

        if result.rows_affected() == 0 {
            return Err(DotMacError::not_found("Role", role.id));
        }

        Self::write_role_permissions(&mut tx, role).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_role(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_role(&self, id: Uuid) -> Result<Option<Role>> {
        let sql = format!("{} WHERE r.id = $1 GROUP BY r.id", ROLE_SELECT);
        let row = sqlx::query_as::<_, RoleRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_role_by_name(&self, tenant_id: Option<Uuid>, name: &str) -> Result<Option<Role>> {
        let sql = format!(
            "{} WHERE r.tenant_id IS NOT DISTINCT FROM $1 AND r.name = $2 GROUP BY r.id",
            ROLE_SELECT
        );
        let row = sqlx::query_as::<_, RoleRow>(&sql)
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_roles(&self, tenant_id: Option<Uuid>) -> Result<Vec<Role>> {
        let sql = format!(
            "{} WHERE ($1::uuid IS NULL OR r.tenant_id IS NULL OR r.tenant_id = $1) \
             GROUP BY r.id ORDER BY r.priority DESC, r.name",
            ROLE_SELECT
        );
        let rows = sqlx::query_as::<_, RoleRow>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_child_roles(&self, parent_id: Uuid) -> Result<Vec<Role>> {
        let sql = format!("{} WHERE r.parent_id = $1 GROUP BY r.id ORDER BY r.name", ROLE_SELECT);
        let rows = sqlx::query_as::<_, RoleRow>(&sql)
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_role_members(&self, role_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_roles WHERE role_id = $1 AND (expires_at IS NULL OR expires_at > $2)",
        )
        .bind(role_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn upsert_user_role(&self, assignment: &UserRole) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_id, granted_by, granted_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, role_id) DO UPDATE
                SET granted_by = EXCLUDED.granted_by,
                    granted_at = EXCLUDED.granted_at,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(assignment.user_id)
        .bind(assignment.role_id)
        .bind(assignment.granted_by)
        .bind(assignment.granted_at)
        .bind(assignment.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_user_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_user_roles(&self, user_id: Uuid) -> Result<Vec<UserRole>> {
        let rows = sqlx::query_as::<_, UserRoleRow>(
            "SELECT * FROM user_roles WHERE user_id = $1 ORDER BY granted_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_expired_user_roles(&self, now: DateTime<Utc>) -> Result<Vec<UserRole>> {
        let rows = sqlx::query_as::<_, UserRoleRow>(
            "DELETE FROM user_roles WHERE expires_at IS NOT NULL AND expires_at <= $1 RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_user_permission(&self, grant: &UserPermission) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_permissions (user_id, permission, granted, granted_by, reason, granted_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id, permission) DO UPDATE
                SET granted = EXCLUDED.granted,
                    granted_by = EXCLUDED.granted_by,
                    reason = EXCLUDED.reason,
                    granted_at = EXCLUDED.granted_at,
                    expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(grant.user_id)
        .bind(&grant.permission)
        .bind(grant.granted)
        .bind(grant.granted_by)
        .bind(&grant.reason)
        .bind(grant.granted_at)
        .bind(grant.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_user_permission(&self, user_id: Uuid, permission: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM user_permissions WHERE user_id = $1 AND permission = $2")
                .bind(user_id)
                .bind(permission)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_user_permissions(&self, user_id: Uuid) -> Result<Vec<UserPermission>> {
        let rows = sqlx::query_as::<_, UserPermissionRow>(
            "SELECT * FROM user_permissions WHERE user_id = $1 ORDER BY permission",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_expired_user_permissions(&self, now: DateTime<Utc>) -> Result<Vec<UserPermission>> {
        let rows = sqlx::query_as::<_, UserPermissionRow>(
            "DELETE FROM user_permissions WHERE expires_at IS NOT NULL AND expires_at <= $1 RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_grant(&self, grant: &PermissionGrant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO permission_grants (id, tenant_id, user_id, role_id, permission, action,
                                           performed_by, reason, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(grant.id)
        .bind(grant.tenant_id)
        .bind(grant.user_id)
        .bind(grant.role_id)
        .bind(&grant.permission)
        .bind(grant.action.as_str())
        .bind(grant.performed_by)
        .bind(&grant.reason)
        .bind(grant.expires_at)
        .bind(grant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_grants(&self, filter: &GrantFilter) -> Result<Vec<PermissionGrant>> {
        let limit = if filter.limit == 0 { i64::MAX } else { filter.limit as i64 };
        let rows = sqlx::query_as::<_, GrantRow>(
            r#"
            SELECT * FROM permission_grants
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR user_id = $2)
              AND ($3::uuid IS NULL OR role_id = $3)
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(filter.tenant_id)
        .bind(filter.user_id)
        .bind(filter.role_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PermissionGrant::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    username: String,
    email: String,
    full_name: Option<String>,
    password_hash: String,
    is_active: bool,
    is_verified: bool,
    mfa_enabled: bool,
    mfa_secret: Option<String>,
    backup_code_hashes: Vec<String>,
    failed_login_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
    last_login_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let mut user = User::new(row.tenant_id, row.username, row.email, row.password_hash);
        user.id = row.id;
        user.full_name = row.full_name;
        user.is_active = row.is_active;
        user.is_verified = row.is_verified;
        user.mfa_enabled = row.mfa_enabled;
        user.mfa_secret = row.mfa_secret;
        user.backup_code_hashes = row.backup_code_hashes;
        user.failed_login_attempts = row.failed_login_attempts;
        user.locked_until = row.locked_until;
        user.last_login_at = row.last_login_at;
        user.created_at = row.created_at;
        user.updated_at = row.updated_at;
        user
    }
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn insert(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, tenant_id, username, email, full_name, password_hash, is_active,
                               is_verified, mfa_enabled, mfa_secret, backup_code_hashes,
                               failed_login_attempts, locked_until, last_login_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(user.id)
        .bind(user.tenant_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.is_verified)
        .bind(user.mfa_enabled)
        .bind(&user.mfa_secret)
        .bind(&user.backup_code_hashes)
        .bind(user.failed_login_attempts)
        .bind(user.locked_until)
        .bind(user.last_login_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "User", "id", &user.id.to_string()))?;
        Ok(())
    }

    async fn update(&self, user: &User) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users SET username = $2, email = $3, full_name = $4, password_hash = $5,
                is_active = $6, is_verified = $7, mfa_enabled = $8, mfa_secret = $9,
                backup_code_hashes = $10, failed_login_attempts = $11, locked_until = $12,
                last_login_at = $13, updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(&user.password_hash)
        .bind(user.is_active)
        .bind(user.is_verified)
        .bind(user.mfa_enabled)
        .bind(&user.mfa_secret)
        .bind(&user.backup_code_hashes)
        .bind(user.failed_login_attempts)
        .bind(user.locked_until)
        .bind(user.last_login_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_unique(e, "User", "email", &user.email))?;

        if result.rows_affected() == 0 {
            return Err(DotMacError::not_found("User", user.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_username(&self, tenant_id: Uuid, username: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE tenant_id = $1 AND username = $2",
        )
        .bind(tenant_id)
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_by_email(&self, tenant_id: Uuid, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE tenant_id = $1 AND lower(email) = $2",
        )
        .bind(tenant_id)
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn list(&self, tenant_id: Uuid, offset: i64, limit: i64) -> Result<(Vec<User>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE tenant_id = $1 ORDER BY created_at OFFSET $2 LIMIT $3",
        )
        .bind(tenant_id)
        .bind(offset.max(0))
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        Ok((rows.into_iter().map(Into::into).collect(), total))
    }
}
