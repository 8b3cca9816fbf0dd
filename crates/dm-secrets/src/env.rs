//! Environment variable secrets provider

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::{validate_key, Provider, SecretsError};

/// Reads secrets from `{prefix}{KEY}` environment variables.
///
/// Writes and deletes are kept in an in-process overlay; the process
/// environment itself is never mutated.
pub struct EnvProvider {
    prefix: String,
    overlay: RwLock<HashMap<String, Option<String>>>,
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overlay: RwLock::new(HashMap::new()),
        }
    }

    /// `database/password` with prefix `DOTMAC_SECRET_` becomes `DOTMAC_SECRET_DATABASE_PASSWORD`
    pub fn env_var_name(&self, key: &str) -> String {
        let normalized: String = key
            .chars()
            .map(|c| match c {
                '/' | '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        format!("{}{}", self.prefix, normalized)
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.overlay.read().get(key) {
            return entry.clone();
        }
        std::env::var(self.env_var_name(key)).ok()
    }
}

#[async_trait]
impl Provider for EnvProvider {
    async fn get(&self, key: &str) -> Result<String, SecretsError> {
        validate_key(key)?;
        self.lookup(key)
            .ok_or_else(|| SecretsError::NotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SecretsError> {
        validate_key(key)?;
        self.overlay
            .write()
            .insert(key.to_string(), Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SecretsError> {
        validate_key(key)?;
        if self.lookup(key).is_none() {
            return Err(SecretsError::NotFound(key.to_string()));
        }
        self.overlay.write().insert(key.to_string(), None);
        Ok(())
    }

    fn name(&self) -> &str {
        "env"
    }
}
