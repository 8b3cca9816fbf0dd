//! DotMac Secrets Management
//!
//! Provides a unified interface for secret storage with multiple backends:
//! - Environment variables (default)
//! - HashiCorp Vault KV v2 (with feature flag)

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

mod env;

pub use env::EnvProvider;

#[cfg(feature = "vault")]
mod vault;
#[cfg(feature = "vault")]
pub use vault::VaultProvider;

#[derive(Error, Debug)]
pub enum SecretsError {
    #[error("Secret not found: {0}")]
    NotFound(String),
    #[error("Invalid key format: {0}")]
    InvalidKey(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Configuration for secrets providers
#[derive(Debug, Clone)]
pub struct SecretsConfig {
    pub provider: String,
    pub env_prefix: String,
    pub vault_addr: Option<String>,
    pub vault_mount: String,
    pub vault_path: String,
    pub vault_token: Option<String>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: "env".to_string(),
            env_prefix: "DOTMAC_SECRET_".to_string(),
            vault_addr: None,
            vault_mount: "secret".to_string(),
            vault_path: "dotmac".to_string(),
            vault_token: None,
        }
    }
}

/// Secrets provider trait
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get a secret by key
    async fn get(&self, key: &str) -> Result<String, SecretsError>;

    /// Set a secret
    async fn set(&self, key: &str, value: &str) -> Result<(), SecretsError>;

    /// Delete a secret
    async fn delete(&self, key: &str) -> Result<(), SecretsError>;

    /// Provider name
    fn name(&self) -> &str;
}

/// Reject empty keys, path traversal and characters outside `[A-Za-z0-9_./-]`.
pub fn validate_key(key: &str) -> Result<(), SecretsError> {
    let valid = !key.is_empty()
        && key.len() <= 256
        && !key.contains("..")
        && !key.starts_with('/')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-'));

    if valid {
        Ok(())
    } else {
        Err(SecretsError::InvalidKey(key.to_string()))
    }
}

/// Create a provider based on configuration
pub fn create_provider(config: &SecretsConfig) -> Result<Arc<dyn Provider>, SecretsError> {
    match config.provider.as_str() {
        "env" => {
            info!(prefix = %config.env_prefix, "Using environment variable secrets provider");
            Ok(Arc::new(EnvProvider::new(config.env_prefix.clone())))
        }
        #[cfg(feature = "vault")]
        "vault" => {
            let addr = config
                .vault_addr
                .as_ref()
                .ok_or_else(|| SecretsError::ProviderError("Vault address required".to_string()))?;
            info!(addr = %addr, mount = %config.vault_mount, "Using HashiCorp Vault provider");
            let provider = VaultProvider::new(
                addr,
                config.vault_mount.clone(),
                config.vault_path.clone(),
                config.vault_token.clone(),
            )?;
            Ok(Arc::new(provider))
        }
        other => Err(SecretsError::ProviderError(format!("Unknown provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("database/password").is_ok());
        assert!(validate_key("smtp.api-key_v2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("/absolute").is_err());
        assert!(validate_key("has space").is_err());
    }

    #[test]
    fn test_create_env_provider() {
        let provider = create_provider(&SecretsConfig::default()).unwrap();
        assert_eq!(provider.name(), "env");
    }

    #[test]
    fn test_unknown_provider() {
        let config = SecretsConfig {
            provider: "s3".to_string(),
            ..Default::default()
        };
        assert!(matches!(create_provider(&config), Err(SecretsError::ProviderError(_))));
    }
}
