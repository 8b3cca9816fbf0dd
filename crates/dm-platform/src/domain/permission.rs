//! Permission Entity
//!
//! Permissions are named `resource:action` (e.g. `users:read`). A trailing
//! `*` segment grants every action below the prefix, and `*` alone is the
//! superuser grant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DotMacError, Result};

/// Superuser grant
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: Uuid,

    /// Unique name, e.g. `billing:invoices:read`
    pub name: String,

    pub display_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Category for grouping in UI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    pub is_active: bool,

    /// Seeded by the platform, cannot be removed
    pub is_system: bool,

    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            display_name: display_name.into(),
            description: None,
            category: None,
            is_active: true,
            is_system: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Resource part of the name (`users` for `users:read`)
    pub fn resource(&self) -> &str {
        self.name.split(':').next().unwrap_or(&self.name)
    }
}

/// Validate a permission name
pub fn validate_permission_name(name: &str) -> Result<()> {
    if name == WILDCARD {
        return Ok(());
    }

    let segments: Vec<&str> = name.split(':').collect();
    if segments.len() < 2 {
        return Err(DotMacError::field(
            "name",
            format!("Permission '{}' must have the form resource:action", name),
        ));
    }

    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if i == last && *segment == WILDCARD {
            continue;
        }
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(DotMacError::field(
                "name",
                format!("Permission '{}' has an invalid segment '{}'", name, segment),
            ));
        }
    }

    Ok(())
}

/// Check whether a granted permission covers a required one
pub fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == required || granted == WILDCARD || granted == "*:*" {
        return true;
    }

    match granted.strip_suffix(WILDCARD) {
        // `users:*` keeps the trailing colon so `users:*` never matches `users_admin:read`
        Some(prefix) if prefix.ends_with(':') => required.starts_with(prefix),
        _ => false,
    }
}

/// Platform permission catalogue
pub mod catalogue {
    pub const USERS_READ: &str = "users:read";
    pub const USERS_READ_SELF: &str = "users:read_self";
    pub const USERS_WRITE: &str = "users:write";
    pub const USERS_DELETE: &str = "users:delete";

    pub const RBAC_READ: &str = "rbac:read";
    pub const RBAC_WRITE: &str = "rbac:write";

    pub const SECRETS_READ: &str = "secrets:read";
    pub const SECRETS_WRITE: &str = "secrets:write";

    pub const GEO_READ: &str = "geo:read";

    /// `(name, display name, category)` seeded at startup
    pub const ALL: &[(&str, &str, &str)] = &[
        (USERS_READ, "Read users", "users"),
        (USERS_READ_SELF, "Read own profile", "users"),
        (USERS_WRITE, "Manage users", "users"),
        (USERS_DELETE, "Delete users", "users"),
        (RBAC_READ, "Read roles and permissions", "rbac"),
        (RBAC_WRITE, "Manage roles and permissions", "rbac"),
        (SECRETS_READ, "Read secrets", "secrets"),
        (SECRETS_WRITE, "Manage secrets", "secrets"),
        (GEO_READ, "Use geocoding", "geo"),
    ];
}
