//! Authentication Domain Events

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::User;
use crate::events::{EventMetadata, ExecutionContext};
use crate::impl_domain_event;

fn user_metadata(ctx: &ExecutionContext, event_type: &str, user: &User) -> EventMetadata {
    let mut metadata = EventMetadata::new(ctx, event_type, "user", user.id);
    metadata.tenant_id = Some(user.tenant_id);
    metadata
}

/// Event emitted when a new user registers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub default_roles: Vec<String>,
}

impl_domain_event!(UserRegistered);

impl UserRegistered {
    pub const EVENT_TYPE: &'static str = "auth.user.registered";

    pub fn new(ctx: &ExecutionContext, user: &User, default_roles: Vec<String>) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            default_roles,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoggedIn {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub session_id: String,
    pub mfa_used: bool,
}

impl_domain_event!(UserLoggedIn);

impl UserLoggedIn {
    pub const EVENT_TYPE: &'static str = "auth.user.logged_in";

    pub fn new(ctx: &ExecutionContext, user: &User, session_id: &str, mfa_used: bool) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
            session_id: session_id.to_string(),
            mfa_used,
        }
    }
}

/// Event emitted for a failed password or MFA check against a known user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFailed {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub reason: String,
    pub failed_attempts: i32,
}

impl_domain_event!(LoginFailed);

impl LoginFailed {
    pub const EVENT_TYPE: &'static str = "auth.login.failed";

    pub fn new(ctx: &ExecutionContext, user: &User, reason: &str) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
            reason: reason.to_string(),
            failed_attempts: user.failed_login_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLocked {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
    pub locked_until: DateTime<Utc>,
}

impl_domain_event!(UserLocked);

impl UserLocked {
    pub const EVENT_TYPE: &'static str = "auth.user.locked";

    pub fn new(ctx: &ExecutionContext, user: &User, locked_until: DateTime<Utc>) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
            locked_until,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaEnabled {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
}

impl_domain_event!(MfaEnabled);

impl MfaEnabled {
    pub const EVENT_TYPE: &'static str = "auth.mfa.enabled";

    pub fn new(ctx: &ExecutionContext, user: &User) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaDisabled {
    #[serde(skip)]
    pub metadata: EventMetadata,

    pub user_id: Uuid,
}

impl_domain_event!(MfaDisabled);

impl MfaDisabled {
    pub const EVENT_TYPE: &'static str = "auth.mfa.disabled";

    pub fn new(ctx: &ExecutionContext, user: &User) -> Self {
        Self {
            metadata: user_metadata(ctx, Self::EVENT_TYPE, user),
            user_id: user.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEvent;

    #[test]
    fn test_auth_events_carry_user_tenant() {
        let user = User::new(Uuid::new_v4(), "alice", "alice@example.com", "hash");
        let ctx = ExecutionContext::system();

        let registered = UserRegistered::new(&ctx, &user, vec!["user".to_string()]);
        assert_eq!(registered.event_type(), "auth.user.registered");
        assert_eq!(registered.tenant_id(), Some(user.tenant_id));
        assert_eq!(registered.payload()["defaultRoles"][0], "user");
        assert_eq!(registered.metadata().aggregate_type, "user");
        assert_eq!(registered.metadata().principal_id, None);

        let failed = LoginFailed::new(&ctx, &user, "invalid_password");
        assert_eq!(failed.payload()["reason"], "invalid_password");
        assert_eq!(failed.aggregate_id(), user.id.to_string());
    }
}
