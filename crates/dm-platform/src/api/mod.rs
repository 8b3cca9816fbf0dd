//! API Layer
//!
//! REST API endpoints for the platform under `/api/v1`.

pub mod auth;
pub mod common;
pub mod geo;
pub mod middleware;
pub mod openapi;
pub mod rbac;
pub mod secrets;
pub mod users;

use axum::{middleware::from_fn_with_state, Extension, Router};
use dm_secrets::Provider;
use std::sync::Arc;

use crate::infra::rate_limit::{rate_limit_middleware, ClientRateLimiter};
use crate::repository::UserRepository;
use crate::service::{AuthService, GeocodingService, RbacService};

pub use common::*;
pub use middleware::{AppState, Authenticated, OptionalAuth};
pub use openapi::PlatformApiDoc;

pub use auth::{auth_router, AuthApiState};
pub use geo::{geo_router, GeoState};
pub use rbac::{rbac_router, RbacApiState};
pub use secrets::{secrets_router, SecretsState};
pub use users::{users_router, UsersState};

/// Everything the routers need
#[derive(Clone)]
pub struct PlatformServices {
    pub auth: Arc<AuthService>,
    pub rbac: Arc<RbacService>,
    pub users: Arc<dyn UserRepository>,
    pub geocoding: Arc<GeocodingService>,
    pub secrets: Arc<dyn Provider>,
    /// `None` disables rate limiting
    pub rate_limiter: Option<Arc<ClientRateLimiter>>,
}

/// All `/api/v1` routers with authentication state and rate limiting
pub fn api_router(services: PlatformServices) -> Router {
    let app_state = AppState {
        auth_service: services.auth.clone(),
    };

    let router = Router::new()
        .nest(
            "/api/v1/auth",
            auth_router(AuthApiState {
                auth: services.auth.clone(),
                users: services.users.clone(),
            }),
        )
        .nest(
            "/api/v1/rbac",
            rbac_router(RbacApiState {
                rbac: services.rbac.clone(),
                users: services.users.clone(),
            }),
        )
        .nest(
            "/api/v1/users",
            users_router(UsersState {
                users: services.users.clone(),
                rbac: services.rbac.clone(),
                auth: services.auth.clone(),
            }),
        )
        .nest(
            "/api/v1/geo",
            geo_router(GeoState {
                geocoding: services.geocoding.clone(),
            }),
        )
        .nest(
            "/api/v1/secrets",
            secrets_router(SecretsState {
                provider: services.secrets.clone(),
            }),
        )
        .layer(Extension(app_state));

    match services.rate_limiter {
        Some(limiter) => router.layer(from_fn_with_state(limiter, rate_limit_middleware)),
        None => router,
    }
}
