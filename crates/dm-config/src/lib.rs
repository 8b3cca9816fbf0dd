//! DotMac Configuration
//!
//! Layered configuration for the platform:
//! 1. Built-in defaults
//! 2. Optional TOML file (`DM_CONFIG_FILE`, or `config/dotmac.toml` when present)
//! 3. `DM_*` environment variable overrides

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/dotmac.toml";

/// Minimum accepted length of the JWT signing secret
pub const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthSettings,
    pub rbac: RbacSettings,
    pub rate_limit: RateLimitSettings,
    pub geo: GeoSettings,
    pub secrets: SecretsSettings,
    pub events: EventSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub api_port: u16,
    pub metrics_port: u16,
    /// Emit logs as JSON lines
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            api_port: 8080,
            metrics_port: 9090,
            json_logs: false,
        }
    }
}

/// Persistence backend for repositories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub storage: StorageBackend,
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::Postgres,
            url: "postgres://localhost:5432/dotmac".to_string(),
            max_connections: 10,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When unset, in-memory cache/session/lock backends are used
    pub url: Option<String>,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: "dotmac".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub mfa_challenge_ttl_secs: u64,
    pub max_failed_attempts: u32,
    pub lockout_minutes: u32,
    pub mfa_issuer: String,
    pub password_min_length: usize,
    pub password_require_special: bool,
    /// Super admin created at startup when username, email and password are set
    pub bootstrap_admin: Option<BootstrapAdmin>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapAdmin {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Tenant the admin account lives in; the nil platform tenant when unset
    pub tenant_id: Option<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            issuer: "dotmac".to_string(),
            audience: "dotmac-api".to_string(),
            access_token_ttl_secs: 900,
            refresh_token_ttl_secs: 86400 * 7,
            mfa_challenge_ttl_secs: 300,
            max_failed_attempts: 5,
            lockout_minutes: 15,
            mfa_issuer: "DotMac".to_string(),
            password_min_length: 8,
            password_require_special: false,
            bootstrap_admin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacSettings {
    pub cache_ttl_secs: u64,
    pub max_hierarchy_depth: usize,
    pub expiry_sweep_secs: u64,
}

impl Default for RbacSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_hierarchy_depth: 10,
            expiry_sweep_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 120,
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub nominatim_url: String,
    pub user_agent: String,
    pub requests_per_second: u32,
    pub cache_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for GeoSettings {
    fn default() -> Self {
        Self {
            nominatim_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: "dotmac-platform/0.1".to_string(),
            requests_per_second: 1,
            cache_ttl_secs: 86400,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsSettings {
    /// `env` or `vault`
    pub provider: String,
    pub env_prefix: String,
    pub vault_addr: Option<String>,
    pub vault_mount: String,
    pub vault_path: String,
    pub vault_token: Option<String>,
}

impl Default for SecretsSettings {
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

/// Integration event bus backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBusKind {
    None,
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub bus: EventBusKind,
    pub source: String,
    pub channel_prefix: String,
    /// Event type prefixes bridged to the bus; empty bridges everything
    pub bridge_prefixes: Vec<String>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            bus: EventBusKind::Memory,
            source: "dotmac-platform".to_string(),
            channel_prefix: "dotmac.events".to_string(),
            bridge_prefixes: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file (if any) and the process environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("DM_CONFIG_FILE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });

        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file, using defaults");
                Self::default()
            }
        };

        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `DM_*` overrides. Unknown keys are ignored.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if !key.starts_with("DM_") {
                continue;
            }
            match key.as_str() {
                "DM_HOST" => self.server.host = value,
                "DM_API_PORT" => self.server.api_port = parse(&key, &value)?,
                "DM_METRICS_PORT" => self.server.metrics_port = parse(&key, &value)?,
                "DM_LOG_FORMAT" => self.server.json_logs = value.eq_ignore_ascii_case("json"),
                "DM_STORAGE" => {
                    self.database.storage = match value.to_lowercase().as_str() {
                        "postgres" => StorageBackend::Postgres,
                        "memory" => StorageBackend::Memory,
                        _ => return Err(invalid(&key, &value)),
                    }
                }
                "DM_DATABASE_URL" => self.database.url = value,
                "DM_DATABASE_MAX_CONNECTIONS" => {
                    self.database.max_connections = parse(&key, &value)?
                }
                "DM_REDIS_URL" => {
                    self.redis.url = if value.is_empty() { None } else { Some(value) }
                }
                "DM_JWT_SECRET" => self.auth.jwt_secret = value,
                "DM_JWT_ISSUER" => self.auth.issuer = value,
                "DM_JWT_AUDIENCE" => self.auth.audience = value,
                "DM_ACCESS_TOKEN_TTL_SECS" => {
                    self.auth.access_token_ttl_secs = parse(&key, &value)?
                }
                "DM_REFRESH_TOKEN_TTL_SECS" => {
                    self.auth.refresh_token_ttl_secs = parse(&key, &value)?
                }
                "DM_MAX_FAILED_ATTEMPTS" => self.auth.max_failed_attempts = parse(&key, &value)?,
                "DM_LOCKOUT_MINUTES" => self.auth.lockout_minutes = parse(&key, &value)?,
                "DM_ADMIN_USERNAME" => self.admin_mut().username = value,
                "DM_ADMIN_EMAIL" => self.admin_mut().email = value,
                "DM_ADMIN_PASSWORD" => self.admin_mut().password = value,
                "DM_ADMIN_TENANT_ID" => self.admin_mut().tenant_id = Some(value),
                "DM_RBAC_CACHE_TTL_SECS" => self.rbac.cache_ttl_secs = parse(&key, &value)?,
                "DM_RBAC_MAX_DEPTH" => self.rbac.max_hierarchy_depth = parse(&key, &value)?,
                "DM_RATE_LIMIT_ENABLED" => self.rate_limit.enabled = parse(&key, &value)?,
                "DM_RATE_LIMIT_PER_MINUTE" => {
                    self.rate_limit.requests_per_minute = parse(&key, &value)?
                }
                "DM_NOMINATIM_URL" => self.geo.nominatim_url = value,
                "DM_GEO_USER_AGENT" => self.geo.user_agent = value,
                "DM_SECRETS_PROVIDER" => self.secrets.provider = value,
                "DM_VAULT_ADDR" => self.secrets.vault_addr = Some(value),
                "DM_VAULT_TOKEN" => self.secrets.vault_token = Some(value),
                "DM_EVENT_BUS" => {
                    self.events.bus = match value.to_lowercase().as_str() {
                        "none" => EventBusKind::None,
                        "memory" => EventBusKind::Memory,
                        "redis" => EventBusKind::Redis,
                        _ => return Err(invalid(&key, &value)),
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn admin_mut(&mut self) -> &mut BootstrapAdmin {
        self.auth.bootstrap_admin.get_or_insert_with(BootstrapAdmin::default)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "auth.jwt_secret must be at least {} bytes",
                MIN_JWT_SECRET_LEN
            )));
        }
        if self.auth.access_token_ttl_secs == 0 || self.auth.refresh_token_ttl_secs == 0 {
            return Err(ConfigError::Invalid("token lifetimes must be positive".to_string()));
        }
        if self.rbac.max_hierarchy_depth == 0 {
            return Err(ConfigError::Invalid(
                "rbac.max_hierarchy_depth must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.requests_per_minute must be positive".to_string(),
            ));
        }
        if let Some(admin) = &self.auth.bootstrap_admin {
            if admin.username.is_empty() || admin.email.is_empty() || admin.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "auth.bootstrap_admin needs username, email and password".to_string(),
                ));
            }
        }
        match self.secrets.provider.as_str() {
            "env" => {}
            "vault" => {
                if self.secrets.vault_addr.is_none() {
                    return Err(ConfigError::Invalid(
                        "secrets.vault_addr is required for the vault provider".to_string(),
                    ));
                }
            }
            other => {
                return Err(ConfigError::Invalid(format!("unknown secrets provider: {}", other)))
            }
        }
        if self.events.bus == EventBusKind::Redis && self.redis.url.is_none() {
            return Err(ConfigError::Invalid(
                "events.bus = redis requires redis.url".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(key, value))
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> AppConfig {
        let mut config = AppConfig::default();
        config.auth.jwt_secret = "x".repeat(MIN_JWT_SECRET_LEN);
        config
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.api_port, 8080);
        assert_eq!(config.database.storage, StorageBackend::Postgres);
        assert_eq!(config.rbac.max_hierarchy_depth, 10);
        assert_eq!(config.secrets.provider, "env");
        assert!(config.redis.url.is_none());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [server]
            api_port = 9000

            [auth]
            jwt_secret = "0123456789abcdef0123456789abcdef"
            lockout_minutes = 30

            [events]
            bus = "none"
            bridge_prefixes = ["rbac."]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.server.metrics_port, 9090);
        assert_eq!(config.auth.lockout_minutes, 30);
        assert_eq!(config.auth.max_failed_attempts, 5);
        assert_eq!(config.events.bus, EventBusKind::None);
        assert_eq!(config.events.bridge_prefixes, vec!["rbac.".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\nstorage = \"memory\"").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::from_file(Path::new("/nonexistent/dotmac.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = valid();
        config
            .apply_env_overrides(vec![
                ("DM_API_PORT".to_string(), "7000".to_string()),
                ("DM_STORAGE".to_string(), "memory".to_string()),
                ("DM_REDIS_URL".to_string(), "redis://localhost:6379".to_string()),
                ("DM_EVENT_BUS".to_string(), "redis".to_string()),
                ("HOME".to_string(), "/root".to_string()),
            ])
            .unwrap();

        assert_eq!(config.server.api_port, 7000);
        assert_eq!(config.database.storage, StorageBackend::Memory);
        assert_eq!(config.redis.url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.events.bus, EventBusKind::Redis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bootstrap_admin_from_env() {
        let mut config = valid();
        config
            .apply_env_overrides(vec![
                ("DM_ADMIN_USERNAME".to_string(), "root".to_string()),
                ("DM_ADMIN_EMAIL".to_string(), "root@example.com".to_string()),
            ])
            .unwrap();
        assert!(config.validate().is_err());

        config
            .apply_env_overrides(vec![("DM_ADMIN_PASSWORD".to_string(), "S3cretpass".to_string())])
            .unwrap();
        let admin = config.auth.bootstrap_admin.as_ref().unwrap();
        assert_eq!(admin.username, "root");
        assert!(admin.tenant_id.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = valid();
        let err = config
            .apply_env_overrides(vec![("DM_API_PORT".to_string(), "not-a-port".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "DM_API_PORT"));
    }

    #[test]
    fn test_validation_rules() {
        assert!(AppConfig::default().validate().is_err());

        let mut config = valid();
        config.rbac.max_hierarchy_depth = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.secrets.provider = "vault".to_string();
        assert!(config.validate().is_err());
        config.secrets.vault_addr = Some("http://vault:8200".to_string());
        assert!(config.validate().is_ok());

        let mut config = valid();
        config.secrets.provider = "s3".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.events.bus = EventBusKind::Redis;
        assert!(config.validate().is_err());
    }
}
