//! User Entity

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{DotMacError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,

    /// Unique per tenant
    pub username: String,

    /// Unique per tenant, stored lowercase
    pub email: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    /// Argon2id PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,

    pub is_active: bool,
    pub is_verified: bool,

    pub mfa_enabled: bool,

    /// Base32 TOTP secret; present but unused until MFA is confirmed
    #[serde(skip_serializing)]
    pub mfa_secret: Option<String>,

    /// SHA-256 hex of unused backup codes
    #[serde(skip_serializing, default)]
    pub backup_code_hashes: Vec<String>,

    pub failed_login_attempts: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(
        tenant_id: Uuid,
        username: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            username: username.into(),
            email: normalize_email(&email.into()),
            full_name: None,
            password_hash: password_hash.into(),
            is_active: true,
            is_verified: false,
            mfa_enabled: false,
            mfa_secret: None,
            backup_code_hashes: Vec::new(),
            failed_login_attempts: 0,
            locked_until: None,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Record a failed login. Returns true if this attempt locked the account.
    pub fn record_failed_login(
        &mut self,
        max_attempts: u32,
        lockout_minutes: u32,
        now: DateTime<Utc>,
    ) -> bool {
        // An expired lock starts a fresh counting window
        if self.locked_until.is_some_and(|until| until <= now) {
            self.locked_until = None;
            self.failed_login_attempts = 0;
        }

        self.failed_login_attempts += 1;
        self.updated_at = now;

        if max_attempts > 0 && self.failed_login_attempts >= max_attempts as i32 {
            self.locked_until = Some(now + Duration::minutes(lockout_minutes as i64));
            return true;
        }
        false
    }

    pub fn record_successful_login(&mut self, now: DateTime<Utc>) {
        self.failed_login_attempts = 0;
        self.locked_until = None;
        self.last_login_at = Some(now);
        self.updated_at = now;
    }

    pub fn activate(&mut self) {
        self.is_active = true;
        self.updated_at = Utc::now();
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
        self.updated_at = Utc::now();
    }

    pub fn enable_mfa(&mut self, backup_code_hashes: Vec<String>) {
        self.mfa_enabled = true;
        self.backup_code_hashes = backup_code_hashes;
        self.updated_at = Utc::now();
    }

    pub fn disable_mfa(&mut self) {
        self.mfa_enabled = false;
        self.mfa_secret = None;
        self.backup_code_hashes.clear();
        self.updated_at = Utc::now();
    }

    pub fn set_email(&mut self, email: &str) {
        self.email = normalize_email(email);
        self.updated_at = Utc::now();
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> Result<()> {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    let re = EMAIL.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
    });
    if re.is_match(email.trim()) {
        Ok(())
    } else {
        Err(DotMacError::field("email", format!("'{}' is not a valid email address", email)))
    }
}

pub fn validate_username(username: &str) -> Result<()> {
    let valid = (3..=64).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DotMacError::field(
            "username",
            "Username must be 3-64 characters of letters, digits, '.', '_' or '-'",
        ))
    }
}
