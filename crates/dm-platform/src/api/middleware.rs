//! API Middleware
//!
//! Bearer token authentication for Axum handlers.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use std::sync::Arc;

use crate::error::DotMacError;
use crate::service::{extract_bearer_token, AuthContext, AuthService};

/// Shared state placed in request extensions for the extractors
#[derive(Clone)]
pub struct AppState {
    pub auth_service: Arc<AuthService>,
}

/// Extractor for authenticated requests.
/// Verifies the access token and resolves the caller's permissions.
pub struct Authenticated(pub AuthContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = DotMacError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| DotMacError::invalid_token("Missing Authorization header"))?;

        let token = extract_bearer_token(header)
            .ok_or_else(|| DotMacError::invalid_token("Invalid Authorization header format"))?;

        let app_state = parts
            .extensions
            .get::<AppState>()
            .ok_or_else(|| DotMacError::internal("AppState extension not installed"))?;

        let context = app_state.auth_service.authenticate(token).await?;
        Ok(Authenticated(context))
    }
}

/// Extractor for routes that behave differently for signed-in callers.
/// Any authentication failure yields `None`.
pub struct OptionalAuth(pub Option<AuthContext>);

#[axum::async_trait]
impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
{
    type Rejection = DotMacError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if !parts.headers.contains_key(AUTHORIZATION) {
            return Ok(OptionalAuth(None));
        }
        Ok(OptionalAuth(
            Authenticated::from_request_parts(parts, state).await.ok().map(|a| a.0),
        ))
    }
}
