//! OpenAPI Documentation
//!
//! Central OpenAPI document for all platform APIs.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Platform API OpenAPI Documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "DotMac Platform API",
        version = "1.0.0",
        description = "Authentication, access control, user administration, geocoding and secrets"
    ),
    servers(
        (url = "http://localhost:8000", description = "Local development")
    ),
    tags(
        (name = "auth", description = "Authentication, sessions and MFA"),
        (name = "rbac", description = "Roles, permissions and the grant audit trail"),
        (name = "users", description = "Tenant user administration"),
        (name = "geo", description = "Geocoding"),
        (name = "secrets", description = "Secrets management")
    ),
    paths(
        // Auth API
        super::auth::register,
        super::auth::login,
        super::auth::verify_mfa,
        super::auth::refresh,
        super::auth::logout,
        super::auth::logout_all,
        super::auth::me,
        super::auth::setup_mfa,
        super::auth::confirm_mfa,
        super::auth::disable_mfa,
        super::auth::regenerate_backup_codes,
        // RBAC Admin API
        super::rbac::list_permissions,
        super::rbac::create_permission,
        super::rbac::list_roles,
        super::rbac::create_role,
        super::rbac::get_role,
        super::rbac::update_role,
        super::rbac::delete_role,
        super::rbac::grant_role_permission,
        super::rbac::revoke_role_permission,
        super::rbac::get_user_permissions,
        super::rbac::my_permissions,
        super::rbac::assign_role,
        super::rbac::revoke_role,
        super::rbac::set_user_permission,
        super::rbac::remove_user_permission,
        super::rbac::list_grants,
        // Users Admin API
        super::users::list_users,
        super::users::get_user,
        super::users::update_user,
        super::users::delete_user,
        super::users::activate_user,
        super::users::deactivate_user,
        // Geo API
        super::geo::geocode,
        super::geo::reverse,
        // Secrets API
        super::secrets::get_secret,
        super::secrets::put_secret,
        super::secrets::delete_secret,
    ),
    components(
        schemas(
            crate::error::ErrorResponse,
            super::common::SuccessResponse,
            // Auth schemas
            super::auth::RegisterRequest,
            super::auth::LoginRequest,
            super::auth::LoginResponse,
            super::auth::MfaVerifyRequest,
            super::auth::RefreshRequest,
            super::auth::MfaCodeRequest,
            super::auth::MfaDisableRequest,
            super::auth::BackupCodesResponse,
            super::auth::LogoutAllResponse,
            super::auth::MeResponse,
            crate::service::TokenPair,
            crate::service::MfaSetup,
            // RBAC schemas
            super::rbac::PermissionResponse,
            super::rbac::CreatePermissionRequest,
            super::rbac::RoleResponse,
            super::rbac::CreateRoleRequest,
            super::rbac::UpdateRoleRequest,
            super::rbac::RolePermissionRequest,
            super::rbac::AssignRoleRequest,
            super::rbac::UserRoleResponse,
            super::rbac::UserPermissionRequest,
            super::rbac::UserPermissionResponse,
            super::rbac::EffectivePermissionsResponse,
            super::rbac::GrantResponse,
            // User schemas
            super::users::UserResponse,
            super::users::UpdateUserRequest,
            // Geo schemas
            crate::service::GeoPoint,
            crate::service::ReverseGeocode,
            // Secrets schemas
            super::secrets::SecretResponse,
            super::secrets::PutSecretRequest,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct PlatformApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}
