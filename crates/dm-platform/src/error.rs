//! Platform Error Types
//!
//! Every error carries an HTTP status, a category and a severity so that
//! handlers, logs and clients agree on how a failure is classified.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    External,
    Database,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Error, Debug)]
pub enum DotMacError {
    #[error("Validation error: {message}")]
    Validation { message: String, field: Option<String> },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    #[error("Multi-factor authentication required")]
    MfaRequired,

    #[error("Invalid MFA code")]
    InvalidMfaCode,

    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Permission denied: {permission}")]
    PermissionDenied { permission: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Duplicate entity: {entity_type} with {field}={value}")]
    Duplicate { entity_type: String, field: String, value: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("External service {service} failed: {message}")]
    ExternalService { service: String, message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Secrets error: {0}")]
    Secrets(#[from] dm_secrets::SecretsError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DotMacError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: None }
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), field: Some(field.into()) }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound { entity_type: entity_type.into(), id: id.to_string() }
    }

    pub fn duplicate(
        entity_type: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self::Duplicate {
            entity_type: entity_type.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden { message: message.into() }
    }

    pub fn permission_denied(permission: impl Into<String>) -> Self {
        Self::PermissionDenied { permission: permission.into() }
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken { message: message.into() }
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService { service: service.into(), message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn status_code(&self) -> StatusCode {
        use dm_secrets::SecretsError;
        match self {
            Self::Validation { .. } | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::InvalidCredentials
            | Self::TokenExpired
            | Self::InvalidToken { .. }
            | Self::MfaRequired
            | Self::InvalidMfaCode => StatusCode::UNAUTHORIZED,
            Self::AccountLocked { .. } => StatusCode::LOCKED,
            Self::AccountDisabled | Self::Forbidden { .. } | Self::PermissionDenied { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Duplicate { .. } | Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            Self::Cache { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Secrets(SecretsError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Secrets(SecretsError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
            Self::Secrets(_) => StatusCode::BAD_GATEWAY,
            Self::Database(_) | Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } | Self::Json(_) => ErrorCategory::Validation,
            Self::InvalidCredentials
            | Self::TokenExpired
            | Self::InvalidToken { .. }
            | Self::MfaRequired
            | Self::InvalidMfaCode
            | Self::AccountLocked { .. } => ErrorCategory::Authentication,
            Self::AccountDisabled | Self::Forbidden { .. } | Self::PermissionDenied { .. } => {
                ErrorCategory::Authorization
            }
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Duplicate { .. } | Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::ExternalService { .. } | Self::Cache { .. } | Self::Secrets(_) => {
                ErrorCategory::External
            }
            Self::Database(_) => ErrorCategory::Database,
            Self::Configuration { .. } | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Validation { .. }
            | Self::Json(_)
            | Self::TokenExpired
            | Self::MfaRequired
            | Self::NotFound { .. }
            | Self::Duplicate { .. }
            | Self::RateLimited { .. } => ErrorSeverity::Low,
            Self::InvalidCredentials
            | Self::InvalidToken { .. }
            | Self::InvalidMfaCode
            | Self::AccountDisabled
            | Self::Forbidden { .. }
            | Self::PermissionDenied { .. }
            | Self::Conflict { .. } => ErrorSeverity::Medium,
            Self::AccountLocked { .. }
            | Self::ExternalService { .. }
            | Self::Cache { .. }
            | Self::Secrets(_) => ErrorSeverity::High,
            Self::Database(_) | Self::Configuration { .. } | Self::Internal { .. } => {
                ErrorSeverity::Critical
            }
        }
    }

    /// Stable machine-readable code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::InvalidToken { .. } => "INVALID_TOKEN",
            Self::MfaRequired => "MFA_REQUIRED",
            Self::InvalidMfaCode => "INVALID_MFA_CODE",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::AccountDisabled => "ACCOUNT_DISABLED",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Duplicate { .. } => "DUPLICATE",
            Self::Conflict { .. } => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Cache { .. } => "CACHE_ERROR",
            Self::Secrets(_) => "SECRETS_ERROR",
            Self::Json(_) => "INVALID_JSON",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ExternalService { .. }
                | Self::Cache { .. }
                | Self::Database(_)
        )
    }

    /// Message safe to show to API clients
    pub fn public_message(&self) -> String {
        if self.status_code().is_server_error() {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<redis::RedisError> for DotMacError {
    fn from(e: redis::RedisError) -> Self {
        Self::Cache { message: e.to_string() }
    }
}

/// Error contract returned by every endpoint
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&DotMacError> for ErrorResponse {
    fn from(e: &DotMacError) -> Self {
        let details = match e {
            DotMacError::Validation { field: Some(field), .. } => {
                Some(serde_json::json!({ "field": field }))
            }
            DotMacError::AccountLocked { until } => {
                Some(serde_json::json!({ "lockedUntil": until.to_rfc3339() }))
            }
            DotMacError::RateLimited { retry_after_secs } => {
                Some(serde_json::json!({ "retryAfterSecs": retry_after_secs }))
            }
            _ => None,
        };

        Self {
            error: e.error_code().to_string(),
            message: e.public_message(),
            category: e.category(),
            severity: e.severity(),
            details,
        }
    }
}

impl IntoResponse for DotMacError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "Request failed");
        } else if self.severity() >= ErrorSeverity::High {
            tracing::warn!(error = %self, code = self.error_code(), "Request rejected");
        }

        let body = ErrorResponse::from(&self);
        let mut response = (status, Json(body)).into_response();

        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, DotMacError>;
