//! JWT issuing and verification (HS256)
//!
//! Three token kinds share one signing key and are told apart by the
//! `token_type` claim: short-lived access tokens, refresh tokens used for
//! rotation, and MFA challenge tokens bridging the password step and the
//! second factor.

use chrono::Utc;
use dm_config::AuthSettings;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{DotMacError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    Mfa,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Mfa => "mfa",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub tenant_id: Uuid,
    pub email: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub token_type: TokenType,
    pub session_id: String,
    /// Unique token id, the key for revocation
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| DotMacError::invalid_token("Malformed subject"))
    }

    /// Seconds until expiry, floored at zero
    pub fn remaining_secs(&self) -> u64 {
        (self.exp - Utc::now().timestamp()).max(0) as u64
    }
}

/// Who a token is issued for
#[derive(Debug, Clone)]
pub struct TokenSubject {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub roles: Vec<String>,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    pub refresh_expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    pub mfa_ttl_secs: u64,
}

impl JwtConfig {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            secret: settings.jwt_secret.clone(),
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            access_ttl_secs: settings.access_token_ttl_secs,
            refresh_ttl_secs: settings.refresh_token_ttl_secs,
            mfa_ttl_secs: settings.mfa_challenge_ttl_secs,
        }
    }
}

pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
        }
    }

    pub fn ttl_secs(&self, token_type: TokenType) -> u64 {
        match token_type {
            TokenType::Access => self.config.access_ttl_secs,
            TokenType::Refresh => self.config.refresh_ttl_secs,
            TokenType::Mfa => self.config.mfa_ttl_secs,
        }
    }

    pub fn issue(&self, token_type: TokenType, subject: &TokenSubject) -> Result<(String, Claims)> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.user_id.to_string(),
            tenant_id: subject.tenant_id,
            email: subject.email.clone(),
            roles: subject.roles.clone(),
            token_type,
            session_id: subject.session_id.clone(),
            jti: Uuid::new_v4().to_string(),
            iat: now,
            exp: now + self.ttl_secs(token_type) as i64,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };
        let token = self.encode_claims(&claims)?;
        Ok((token, claims))
    }

    /// Access and refresh token for one session
    pub fn issue_pair(&self, subject: &TokenSubject) -> Result<(TokenPair, Claims, Claims)> {
        let (access_token, access) = self.issue(TokenType::Access, subject)?;
        let (refresh_token, refresh) = self.issue(TokenType::Refresh, subject)?;
        let pair = TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl_secs,
            refresh_expires_in: self.config.refresh_ttl_secs,
        };
        Ok((pair, access, refresh))
    }

    pub(crate) fn encode_claims(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| DotMacError::internal(format!("Failed to sign token: {}", e)))
    }

    /// Verify signature, issuer, audience, expiry and token type
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => DotMacError::TokenExpired,
                ErrorKind::InvalidIssuer => DotMacError::invalid_token("Invalid issuer"),
                ErrorKind::InvalidAudience => DotMacError::invalid_token("Invalid audience"),
                ErrorKind::InvalidSignature => DotMacError::invalid_token("Invalid signature"),
                _ => DotMacError::invalid_token(e.to_string()),
            }
        })?;

        if data.claims.token_type != expected {
            return Err(DotMacError::invalid_token(format!(
                "Expected {} token, got {}",
                expected.as_str(),
                data.claims.token_type.as_str()
            )));
        }
        Ok(data.claims)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim())
    } else {
        None
    }
}
