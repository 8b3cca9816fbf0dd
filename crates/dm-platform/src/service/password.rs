//! Password hashing and policy

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::{DotMacError, Result};

#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: false,
        }
    }
}

impl PasswordPolicy {
    pub fn from_settings(settings: &dm_config::AuthSettings) -> Self {
        Self {
            min_length: settings.password_min_length,
            require_special: settings.password_require_special,
            ..Self::default()
        }
    }

    /// Collects every violated rule so the client can show them together
    pub fn validate(&self, password: &str) -> Result<()> {
        let mut problems = Vec::new();

        if password.chars().count() < self.min_length {
            problems.push(format!("at least {} characters", self.min_length));
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            problems.push("an uppercase letter".to_string());
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            problems.push("a lowercase letter".to_string());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            problems.push("a digit".to_string());
        }
        if self.require_special && password.chars().all(|c| c.is_alphanumeric()) {
            problems.push("a special character".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DotMacError::field(
                "password",
                format!("Password must contain {}", problems.join(", ")),
            ))
        }
    }
}

/// Argon2id hashing
#[derive(Clone, Default)]
pub struct PasswordService {
    policy: PasswordPolicy,
}

impl PasswordService {
    pub fn new(policy: PasswordPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PasswordPolicy {
        &self.policy
    }

    /// Validate against the policy, then hash
    pub fn hash_password(&self, password: &str) -> Result<String> {
        self.policy.validate(password)?;
        self.hash_unchecked(password)
    }

    fn hash_unchecked(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| DotMacError::internal(format!("Password hashing failed: {}", e)))
    }

    /// A malformed stored hash counts as a mismatch
    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                tracing::warn!(error = %e, "Stored password hash is malformed");
                false
            }
        }
    }
}
