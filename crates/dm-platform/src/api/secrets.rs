//! Secrets API
//!
//! Read and write access to the configured secrets provider. Values are
//! only ever returned to holders of `secrets:read`. Tenant users see only
//! their tenant's subtree `tenants/{tenant_id}/`; superusers address the
//! whole keyspace.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use dm_secrets::{validate_key, Provider};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use utoipa::ToSchema;

use crate::api::common::SuccessResponse;
use crate::api::middleware::Authenticated;
use crate::domain::catalogue;
use crate::error::Result;
use crate::service::AuthContext;

const TENANT_KEY_ROOT: &str = "tenants";

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretResponse {
    pub key: String,
    pub value: String,
    pub provider: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PutSecretRequest {
    pub value: String,
}

/// Secrets service state
#[derive(Clone)]
pub struct SecretsState {
    pub provider: Arc<dyn Provider>,
}

/// Provider key for a key as the caller names it
fn scoped_key(auth: &AuthContext, key: &str) -> Result<String> {
    validate_key(key)?;
    if auth.is_superuser() {
        Ok(key.to_string())
    } else {
        Ok(format!("{}/{}/{}", TENANT_KEY_ROOT, auth.tenant_id, key))
    }
}

/// Read a secret
#[utoipa::path(
    get,
    path = "/api/v1/secrets/{key}",
    tag = "secrets",
    params(("key" = String, Path, description = "Secret key")),
    responses(
        (status = 200, description = "Secret value", body = SecretResponse),
        (status = 404, description = "Secret not found")
    ),
    security(("bearer_auth" = []))
)]
pub async fn get_secret(
    State(state): State<SecretsState>,
    auth: Authenticated,
    Path(key): Path<String>,
) -> Result<Json<SecretResponse>> {
    auth.0.require(catalogue::SECRETS_READ)?;
    let scoped = scoped_key(&auth.0, &key)?;
    let value = state.provider.get(&scoped).await?;
    info!(key = %scoped, user_id = %auth.0.user_id, "Secret read");
    Ok(Json(SecretResponse {
        key,
        value,
        provider: state.provider.name().to_string(),
    }))
}

/// Create or replace a secret
#[utoipa::path(
    put,
    path = "/api/v1/secrets/{key}",
    tag = "secrets",
    params(("key" = String, Path, description = "Secret key")),
    request_body = PutSecretRequest,
    responses((status = 200, description = "Secret stored", body = SuccessResponse)),
    security(("bearer_auth" = []))
)]
pub async fn put_secret(
    State(state): State<SecretsState>,
    auth: Authenticated,
    Path(key): Path<String>,
    Json(req): Json<PutSecretRequest>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::SECRETS_WRITE)?;
    let scoped = scoped_key(&auth.0, &key)?;
    state.provider.set(&scoped, &req.value).await?;
    info!(key = %scoped, user_id = %auth.0.user_id, "Secret written");
    Ok(Json(SuccessResponse::ok()))
}

/// Delete a secret
#[utoipa::path(
    delete,
    path = "/api/v1/secrets/{key}",
    tag = "secrets",
    params(("key" = String, Path, description = "Secret key")),
    responses(
        (status = 200, description = "Secret deleted", body = SuccessResponse),
        (status = 404, description = "Secret not found")
    ),
    security(("bearer_auth" = []))
)]
pub async fn delete_secret(
    State(state): State<SecretsState>,
    auth: Authenticated,
    Path(key): Path<String>,
) -> Result<Json<SuccessResponse>> {
    auth.0.require(catalogue::SECRETS_WRITE)?;
    let scoped = scoped_key(&auth.0, &key)?;
    state.provider.delete(&scoped).await?;
    info!(key = %scoped, user_id = %auth.0.user_id, "Secret deleted");
    Ok(Json(SuccessResponse::ok()))
}

/// Create secrets router. Keys may contain `/`, so the route matches
/// the rest of the path.
pub fn secrets_router(state: SecretsState) -> Router {
    Router::new()
        .route("/*key", get(get_secret).put(put_secret).delete(delete_secret))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::authorization::test_context;
    use uuid::Uuid;

    #[test]
    fn test_tenant_keys_are_scoped() {
        let tenant = Uuid::new_v4();
        let ctx = test_context(tenant, &["secrets:*"]);
        assert_eq!(
            scoped_key(&ctx, "smtp/password").unwrap(),
            format!("tenants/{}/smtp/password", tenant)
        );
        assert!(scoped_key(&ctx, "../other/smtp").is_err());

        let admin = test_context(tenant, &["*"]);
        assert_eq!(scoped_key(&admin, "smtp/password").unwrap(), "smtp/password");
    }
}
