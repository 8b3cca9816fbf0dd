//! Authentication Service
//!
//! Registration, password login with lockout, the MFA second step, refresh
//! token rotation, logout and per-request token authentication.

use chrono::Utc;
use dm_config::AuthSettings;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::{system_roles, validate_email, validate_username, User};
use crate::error::{DotMacError, Result};
use crate::events::auth::{LoginFailed, MfaDisabled, MfaEnabled, UserLocked, UserLoggedIn, UserRegistered};
use crate::events::{DomainEventPublisher, ExecutionContext};
use crate::repository::UserRepository;
use crate::service::authorization::AuthContext;
use crate::service::jwt::{Claims, JwtService, TokenPair, TokenSubject, TokenType};
use crate::service::mfa::MfaService;
use crate::service::password::PasswordService;
use crate::service::rbac::RbacService;
use crate::service::session::{Session, SessionStore};

#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub tenant_id: Uuid,
    pub username: String,
    pub email: String,
    pub password: String,
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated { user: User, tokens: TokenPair },
    /// Password accepted; exchange the challenge and a code for tokens
    MfaRequired { challenge_token: String, expires_in: u64 },
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MfaSetup {
    /// Base32 TOTP secret
    pub secret: String,
    pub provisioning_uri: String,
}

#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    pub max_failed_attempts: u32,
    pub lockout_minutes: u32,
}

impl LockoutPolicy {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            max_failed_attempts: settings.max_failed_attempts,
            lockout_minutes: settings.lockout_minutes,
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_minutes: 15,
        }
    }
}

pub struct AuthService {
    users: Arc<dyn UserRepository>,
    rbac: Arc<RbacService>,
    passwords: PasswordService,
    jwt: Arc<JwtService>,
    sessions: Arc<dyn SessionStore>,
    mfa: MfaService,
    publisher: Arc<DomainEventPublisher>,
    lockout: LockoutPolicy,
}

fn record_login_attempt(outcome: &'static str) {
    metrics::counter!("dm_login_attempts_total", "outcome" => outcome).increment(1);
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserRepository>,
        rbac: Arc<RbacService>,
        passwords: PasswordService,
        jwt: Arc<JwtService>,
        sessions: Arc<dyn SessionStore>,
        mfa: MfaService,
        publisher: Arc<DomainEventPublisher>,
        lockout: LockoutPolicy,
    ) -> Self {
        Self {
            users,
            rbac,
            passwords,
            jwt,
            sessions,
            mfa,
            publisher,
            lockout,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    async fn load_user(&self, user_id: Uuid) -> Result<User> {
        self.users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DotMacError::not_found("User", user_id))
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register(&self, ctx: &ExecutionContext, input: RegisterInput) -> Result<User> {
        let username = input.username.trim();
        validate_username(username)?;
        validate_email(&input.email)?;
        let password_hash = self.passwords.hash_password(&input.password)?;

        if self.users.find_by_username(input.tenant_id, username).await?.is_some() {
            return Err(DotMacError::duplicate("User", "username", username));
        }
        if self.users.find_by_email(input.tenant_id, &input.email).await?.is_some() {
            return Err(DotMacError::duplicate("User", "email", input.email.trim()));
        }

        let mut user = User::new(input.tenant_id, username, &input.email, password_hash);
        user.full_name = input.full_name.filter(|n| !n.trim().is_empty());
        self.users.insert(&user).await?;

        let ctx = ctx.clone().with_tenant(Some(user.tenant_id));
        let mut default_roles = Vec::new();
        for role in self.rbac.default_roles(user.tenant_id).await? {
            self.rbac.assign_role(&ctx, user.id, role.id, None).await?;
            default_roles.push(role.name);
        }

        self.publisher
            .publish(&UserRegistered::new(&ctx, &user, default_roles))
            .await;
        info!(user_id = %user.id, tenant_id = %user.tenant_id, "User registered");
        Ok(user)
    }

    /// Create the initial super administrator if that username is free
    pub async fn ensure_admin(&self, input: RegisterInput) -> Result<User> {
        if let Some(existing) = self.users.find_by_username(input.tenant_id, &input.username).await? {
            return Ok(existing);
        }
        let ctx = ExecutionContext::system();
        let mut user = self.register(&ctx, input).await?;
        let role = self
            .rbac
            .repository()
            .find_role_by_name(None, system_roles::SUPER_ADMIN)
            .await?
            .ok_or_else(|| DotMacError::internal("super_admin role has not been seeded"))?;
        self.rbac.assign_role(&ctx, user.id, role.id, None).await?;

        user.is_verified = true;
        self.users.update(&user).await?;
        info!(user_id = %user.id, "Bootstrap administrator created");
        Ok(user)
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    async fn find_login_user(&self, tenant_id: Uuid, identifier: &str) -> Result<Option<User>> {
        let identifier = identifier.trim();
        if let Some(user) = self.users.find_by_username(tenant_id, identifier).await? {
            return Ok(Some(user));
        }
        if identifier.contains('@') {
            return self.users.find_by_email(tenant_id, identifier).await;
        }
        Ok(None)
    }

    /// Count a failed password or code. Returns the error to surface.
    async fn register_failure(&self, user: &mut User, reason: &str) -> Result<DotMacError> {
        let now = Utc::now();
        let locked = user.record_failed_login(
            self.lockout.max_failed_attempts,
            self.lockout.lockout_minutes,
            now,
        );
        self.users.update(user).await?;

        let ctx = ExecutionContext::system().with_tenant(Some(user.tenant_id));
        self.publisher.publish(&LoginFailed::new(&ctx, user, reason)).await;

        match user.locked_until {
            Some(until) if locked => {
                warn!(user_id = %user.id, until = %until, "Account locked after repeated failures");
                self.publisher.publish(&UserLocked::new(&ctx, user, until)).await;
                record_login_attempt("locked");
                Ok(DotMacError::AccountLocked { until })
            }
            _ => {
                record_login_attempt(reason_outcome(reason));
                Ok(if reason == "invalid_mfa_code" {
                    DotMacError::InvalidMfaCode
                } else {
                    DotMacError::InvalidCredentials
                })
            }
        }
    }

    pub async fn login(
        &self,
        tenant_id: Uuid,
        identifier: &str,
        password: &str,
        client: ClientInfo,
    ) -> Result<LoginOutcome> {
        let Some(mut user) = self.find_login_user(tenant_id, identifier).await? else {
            record_login_attempt("unknown_user");
            return Err(DotMacError::InvalidCredentials);
        };

        let now = Utc::now();
        if let Some(until) = user.locked_until.filter(|_| user.is_locked(now)) {
            record_login_attempt("locked");
            return Err(DotMacError::AccountLocked { until });
        }

        if !self.passwords.verify_password(password, &user.password_hash) {
            return Err(self.register_failure(&mut user, "invalid_password").await?);
        }

        if !user.is_active {
            record_login_attempt("disabled");
            return Err(DotMacError::AccountDisabled);
        }

        if user.mfa_enabled {
            let subject = TokenSubject {
                user_id: user.id,
                tenant_id: user.tenant_id,
                email: user.email.clone(),
                roles: Vec::new(),
                session_id: String::new(),
            };
            let (challenge_token, _) = self.jwt.issue(TokenType::Mfa, &subject)?;
            record_login_attempt("mfa_required");
            return Ok(LoginOutcome::MfaRequired {
                challenge_token,
                expires_in: self.jwt.ttl_secs(TokenType::Mfa),
            });
        }

        let tokens = self.start_session(&mut user, false, client).await?;
        Ok(LoginOutcome::Authenticated { user, tokens })
    }

    /// Second login step: TOTP code or single-use backup code
    pub async fn complete_mfa_login(
        &self,
        challenge_token: &str,
        code: &str,
        client: ClientInfo,
    ) -> Result<(User, TokenPair)> {
        let claims = self.jwt.verify(challenge_token, TokenType::Mfa)?;
        if self.sessions.is_revoked(&claims.jti).await? {
            return Err(DotMacError::invalid_token("MFA challenge already used"));
        }

        let mut user = self.load_user(claims.user_id()?).await?;
        let now = Utc::now();
        if let Some(until) = user.locked_until.filter(|_| user.is_locked(now)) {
            return Err(DotMacError::AccountLocked { until });
        }
        if !user.is_active {
            return Err(DotMacError::AccountDisabled);
        }

        if !self.check_second_factor(&mut user, code)? {
            return Err(self.register_failure(&mut user, "invalid_mfa_code").await?);
        }

        if !self.sessions.revoke_token(&claims.jti, claims.remaining_secs()).await? {
            return Err(DotMacError::invalid_token("MFA challenge already used"));
        }
        let tokens = self.start_session(&mut user, true, client).await?;
        Ok((user, tokens))
    }

    /// TOTP first, then backup codes. A matched backup code is consumed
    /// on the in-memory user; callers persist it.
    fn check_second_factor(&self, user: &mut User, code: &str) -> Result<bool> {
        let Some(secret) = user.mfa_secret.as_deref() else {
            return Ok(false);
        };
        let now = Utc::now().timestamp().max(0) as u64;
        if self.mfa.verify_code(secret, code, now)? {
            return Ok(true);
        }
        if let Some(index) = MfaService::match_backup_code(code, &user.backup_code_hashes) {
            user.backup_code_hashes.remove(index);
            info!(
                user_id = %user.id,
                remaining = user.backup_code_hashes.len(),
                "Backup code used"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn start_session(&self, user: &mut User, mfa_used: bool, client: ClientInfo) -> Result<TokenPair> {
        user.record_successful_login(Utc::now());
        self.users.update(user).await?;

        let permissions = self.rbac.effective_permissions(user.id).await?;
        let mut session = Session::new(user.id, user.tenant_id, self.jwt.ttl_secs(TokenType::Refresh));
        session.ip_address = client.ip_address;
        session.user_agent = client.user_agent;

        let subject = TokenSubject {
            user_id: user.id,
            tenant_id: user.tenant_id,
            email: user.email.clone(),
            roles: permissions.roles.clone(),
            session_id: session.id.clone(),
        };
        let (tokens, _, refresh) = self.jwt.issue_pair(&subject)?;
        session.refresh_jti = refresh.jti;
        self.sessions.save(&session).await?;

        let ctx = ExecutionContext::for_principal(user.id, Some(user.tenant_id));
        self.publisher
            .publish(&UserLoggedIn::new(&ctx, user, &session.id, mfa_used))
            .await;
        record_login_attempt("success");
        info!(user_id = %user.id, session_id = %session.id, mfa_used, "User logged in");
        Ok(tokens)
    }

    // ------------------------------------------------------------------
    // Tokens and sessions
    // ------------------------------------------------------------------

    /// Rotate: the presented refresh token is revoked and a new pair issued.
    /// Presenting an already rotated token ends the whole session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.jwt.verify(refresh_token, TokenType::Refresh)?;
        if self.sessions.is_revoked(&claims.jti).await? {
            warn!(session_id = %claims.session_id, "Revoked refresh token presented");
            self.sessions.delete(&claims.session_id).await?;
            return Err(DotMacError::invalid_token("Refresh token has been revoked"));
        }

        let Some(mut session) = self.sessions.get(&claims.session_id).await? else {
            return Err(DotMacError::invalid_token("Session has ended"));
        };
        if session.refresh_jti != claims.jti {
            warn!(session_id = %session.id, "Refresh token reuse detected");
            self.sessions.delete(&session.id).await?;
            return Err(DotMacError::invalid_token("Refresh token has been revoked"));
        }

        // Only the caller that revokes the token may rotate it
        if !self.sessions.revoke_token(&claims.jti, claims.remaining_secs()).await? {
            warn!(session_id = %session.id, "Concurrent refresh with the same token");
            self.sessions.delete(&session.id).await?;
            return Err(DotMacError::invalid_token("Refresh token has been revoked"));
        }

        let user = self.load_user(claims.user_id()?).await?;
        if !user.is_active {
            self.sessions.delete(&session.id).await?;
            return Err(DotMacError::AccountDisabled);
        }

        let permissions = self.rbac.effective_permissions(user.id).await?;
        let subject = TokenSubject {
            user_id: user.id,
            tenant_id: user.tenant_id,
            email: user.email.clone(),
            roles: permissions.roles.clone(),
            session_id: session.id.clone(),
        };
        let (tokens, _, refresh) = self.jwt.issue_pair(&subject)?;
        session.refresh_jti = refresh.jti;
        self.sessions.save(&session).await?;
        Ok(tokens)
    }

    /// Verify an access token and resolve the caller's permissions
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthContext> {
        let claims = self.jwt.verify(access_token, TokenType::Access)?;
        if self.sessions.is_revoked(&claims.jti).await? {
            return Err(DotMacError::invalid_token("Token has been revoked"));
        }
        if self.sessions.get(&claims.session_id).await?.is_none() {
            return Err(DotMacError::invalid_token("Session has ended"));
        }

        let user_id = claims.user_id()?;
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| DotMacError::invalid_token("Unknown user"))?;
        if !user.is_active {
            return Err(DotMacError::AccountDisabled);
        }

        let permissions = self.rbac.effective_permissions(user_id).await?;
        Ok(build_context(claims, user_id, permissions))
    }

    pub async fn logout(&self, auth: &AuthContext) -> Result<()> {
        let remaining = (auth.token_expires_at - Utc::now().timestamp()).max(0) as u64;
        self.sessions.revoke_token(&auth.token_id, remaining).await?;
        self.sessions.delete(&auth.session_id).await?;
        info!(user_id = %auth.user_id, session_id = %auth.session_id, "User logged out");
        Ok(())
    }

    /// End every session of the user. Returns the number ended.
    pub async fn logout_all(&self, auth: &AuthContext) -> Result<usize> {
        let remaining = (auth.token_expires_at - Utc::now().timestamp()).max(0) as u64;
        self.sessions.revoke_token(&auth.token_id, remaining).await?;
        let ended = self.sessions.delete_all_for_user(auth.user_id).await?;
        info!(user_id = %auth.user_id, sessions = ended, "All sessions ended");
        Ok(ended)
    }

    /// End a user's sessions on their behalf, e.g. after deactivation
    pub async fn end_sessions(&self, user_id: Uuid) -> Result<usize> {
        let ended = self.sessions.delete_all_for_user(user_id).await?;
        if ended > 0 {
            info!(user_id = %user_id, sessions = ended, "Sessions ended by administrator");
        }
        Ok(ended)
    }

    // ------------------------------------------------------------------
    // MFA management
    // ------------------------------------------------------------------

    /// Generate a pending secret; MFA stays off until confirmed
    pub async fn setup_mfa(&self, user_id: Uuid) -> Result<MfaSetup> {
        let mut user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            return Err(DotMacError::conflict("MFA is already enabled"));
        }
        let secret = self.mfa.generate_secret();
        let provisioning_uri = self.mfa.provisioning_uri(&secret, &user.email);
        user.mfa_secret = Some(secret.clone());
        user.updated_at = Utc::now();
        self.users.update(&user).await?;
        Ok(MfaSetup { secret, provisioning_uri })
    }

    /// Enable MFA with a valid code for the pending secret. Returns the
    /// plaintext backup codes, shown only once.
    pub async fn confirm_mfa(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        code: &str,
    ) -> Result<Vec<String>> {
        let mut user = self.load_user(user_id).await?;
        if user.mfa_enabled {
            return Err(DotMacError::conflict("MFA is already enabled"));
        }
        let Some(secret) = user.mfa_secret.clone() else {
            return Err(DotMacError::conflict("MFA setup has not been started"));
        };
        let now = Utc::now().timestamp().max(0) as u64;
        if !self.mfa.verify_code(&secret, code, now)? {
            return Err(DotMacError::InvalidMfaCode);
        }

        let codes = self.mfa.generate_backup_codes();
        user.enable_mfa(codes.iter().map(|c| MfaService::hash_backup_code(c)).collect());
        self.users.update(&user).await?;

        self.publisher.publish(&MfaEnabled::new(ctx, &user)).await;
        info!(user_id = %user.id, "MFA enabled");
        Ok(codes)
    }

    /// Requires the password and a current code or backup code
    pub async fn disable_mfa(
        &self,
        ctx: &ExecutionContext,
        user_id: Uuid,
        password: &str,
        code: &str,
    ) -> Result<()> {
        let mut user = self.load_user(user_id).await?;
        if !user.mfa_enabled {
            return Err(DotMacError::conflict("MFA is not enabled"));
        }
        if !self.passwords.verify_password(password, &user.password_hash) {
            return Err(DotMacError::InvalidCredentials);
        }
        if !self.check_second_factor(&mut user, code)? {
            return Err(DotMacError::InvalidMfaCode);
        }

        user.disable_mfa();
        self.users.update(&user).await?;
        self.publisher.publish(&MfaDisabled::new(ctx, &user)).await;
        info!(user_id = %user.id, "MFA disabled");
        Ok(())
    }

    /// Replace all backup codes; requires a current TOTP code
    pub async fn regenerate_backup_codes(&self, user_id: Uuid, code: &str) -> Result<Vec<String>> {
        let mut user = self.load_user(user_id).await?;
        let Some(secret) = user.mfa_secret.clone().filter(|_| user.mfa_enabled) else {
            return Err(DotMacError::conflict("MFA is not enabled"));
        };
        let now = Utc::now().timestamp().max(0) as u64;
        if !self.mfa.verify_code(&secret, code, now)? {
            return Err(DotMacError::InvalidMfaCode);
        }

        let codes = self.mfa.generate_backup_codes();
        user.backup_code_hashes = codes.iter().map(|c| MfaService::hash_backup_code(c)).collect();
        user.updated_at = Utc::now();
        self.users.update(&user).await?;
        Ok(codes)
    }
}

fn reason_outcome(reason: &str) -> &'static str {
    match reason {
        "invalid_mfa_code" => "invalid_mfa_code",
        _ => "invalid_password",
    }
}

fn build_context(
    claims: Claims,
    user_id: Uuid,
    permissions: Arc<crate::service::rbac::EffectivePermissions>,
) -> AuthContext {
    AuthContext {
        user_id,
        tenant_id: claims.tenant_id,
        email: claims.email,
        roles: claims.roles,
        session_id: claims.session_id,
        token_id: claims.jti,
        token_expires_at: claims.exp,
        permissions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEventDispatcher;
    use crate::repository::{MemoryRbacRepository, MemoryUserRepository};
    use crate::service::jwt::JwtConfig;
    use crate::service::session::MemorySessionStore;

    const PASSWORD: &str = "Sup3rSecret";

    struct Fixture {
        auth: AuthService,
        rbac: Arc<RbacService>,
        mfa: MfaService,
        tenant: Uuid,
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemorySessionStore::new())).await
    }

    async fn fixture_with(sessions: Arc<dyn SessionStore>) -> Fixture {
        let users: Arc<dyn UserRepository> = Arc::new(MemoryUserRepository::new());
        let publisher = Arc::new(DomainEventPublisher::new(Arc::new(DomainEventDispatcher::new()), "test"));
        let rbac = Arc::new(RbacService::new(
            Arc::new(MemoryRbacRepository::new()),
            users.clone(),
            publisher.clone(),
        ));
        rbac.bootstrap_defaults().await.unwrap();

        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "unit-test-secret-with-enough-length-123".to_string(),
            issuer: "dotmac".to_string(),
            audience: "dotmac-api".to_string(),
            access_ttl_secs: 900,
            refresh_ttl_secs: 3600,
            mfa_ttl_secs: 300,
        }));
        let auth = AuthService::new(
            users,
            rbac.clone(),
            PasswordService::default(),
            jwt,
            sessions,
            MfaService::new("DotMac"),
            publisher,
            LockoutPolicy { max_failed_attempts: 3, lockout_minutes: 15 },
        );
        Fixture { auth, rbac, mfa: MfaService::new("DotMac"), tenant: Uuid::new_v4() }
    }

    async fn register(f: &Fixture, username: &str) -> User {
        f.auth
            .register(
                &ExecutionContext::system(),
                RegisterInput {
                    tenant_id: f.tenant,
                    username: username.to_string(),
                    email: format!("{}@example.com", username),
                    password: PASSWORD.to_string(),
                    full_name: None,
                },
            )
            .await
            .unwrap()
    }

    async fn login_tokens(f: &Fixture, username: &str) -> TokenPair {
        match f.auth.login(f.tenant, username, PASSWORD, ClientInfo::default()).await.unwrap() {
            LoginOutcome::Authenticated { tokens, .. } => tokens,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    fn now() -> u64 {
        Utc::now().timestamp() as u64
    }

    #[tokio::test]
    async fn test_register_assigns_default_role() {
        let f = fixture().await;
        let user = register(&f, "alice").await;
        let perms = f.rbac.effective_permissions(user.id).await.unwrap();
        assert_eq!(perms.roles, vec!["user".to_string()]);
        assert!(perms.allows("geo:read"));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_weak_passwords() {
        let f = fixture().await;
        register(&f, "alice").await;

        let dup = f
            .auth
            .register(
                &ExecutionContext::system(),
                RegisterInput {
                    tenant_id: f.tenant,
                    username: "alice".to_string(),
                    email: "other@example.com".to_string(),
                    password: PASSWORD.to_string(),
                    full_name: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(dup, DotMacError::Duplicate { .. }));

        let weak = f
            .auth
            .register(
                &ExecutionContext::system(),
                RegisterInput {
                    tenant_id: f.tenant,
                    username: "bob".to_string(),
                    email: "bob@example.com".to_string(),
                    password: "short".to_string(),
                    full_name: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(weak, DotMacError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_login_by_username_or_email() {
        let f = fixture().await;
        register(&f, "alice").await;

        let tokens = login_tokens(&f, "alice").await;
        let ctx = f.auth.authenticate(&tokens.access_token).await.unwrap();
        assert_eq!(ctx.tenant_id, f.tenant);
        assert!(ctx.has("users:read_self"));

        login_tokens(&f, "ALICE@example.com").await;
    }

    #[tokio::test]
    async fn test_lockout_after_failures() {
        let f = fixture().await;
        register(&f, "alice").await;

        for _ in 0..2 {
            let err = f.auth.login(f.tenant, "alice", "Wrong1pass", ClientInfo::default()).await.unwrap_err();
            assert!(matches!(err, DotMacError::InvalidCredentials));
        }
        let err = f.auth.login(f.tenant, "alice", "Wrong1pass", ClientInfo::default()).await.unwrap_err();
        assert!(matches!(err, DotMacError::AccountLocked { .. }));

        // Correct password is still refused while locked
        let err = f.auth.login(f.tenant, "alice", PASSWORD, ClientInfo::default()).await.unwrap_err();
        assert!(matches!(err, DotMacError::AccountLocked { .. }));
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let f = fixture().await;
        let err = f.auth.login(f.tenant, "ghost", PASSWORD, ClientInfo::default()).await.unwrap_err();
        assert!(matches!(err, DotMacError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_refresh_rotation_and_reuse() {
        let f = fixture().await;
        register(&f, "alice").await;
        let first = login_tokens(&f, "alice").await;

        let second = f.auth.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.refresh_token, first.refresh_token);

        // Reusing the rotated token fails and ends the session
        assert!(f.auth.refresh(&first.refresh_token).await.is_err());
        assert!(f.auth.refresh(&second.refresh_token).await.is_err());
        assert!(f.auth.authenticate(&second.access_token).await.is_err());
    }

    /// Serves each session as first read and never reports a revocation,
    /// like a request that passed its checks before a concurrent one rotated
    struct StaleReads {
        inner: MemorySessionStore,
        first_seen: dashmap::DashMap<String, Session>,
    }

    #[async_trait::async_trait]
    impl SessionStore for StaleReads {
        async fn save(&self, session: &Session) -> Result<()> {
            self.inner.save(session).await
        }

        async fn get(&self, session_id: &str) -> Result<Option<Session>> {
            if let Some(seen) = self.first_seen.get(session_id) {
                return Ok(Some(seen.clone()));
            }
            let session = self.inner.get(session_id).await?;
            if let Some(session) = &session {
                self.first_seen.insert(session_id.to_string(), session.clone());
            }
            Ok(session)
        }

        async fn delete(&self, session_id: &str) -> Result<bool> {
            self.inner.delete(session_id).await
        }

        async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize> {
            self.inner.delete_all_for_user(user_id).await
        }

        async fn revoke_token(&self, jti: &str, ttl_secs: u64) -> Result<bool> {
            self.inner.revoke_token(jti, ttl_secs).await
        }

        async fn is_revoked(&self, _jti: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_racing_refresh_rotates_once() {
        let store = Arc::new(StaleReads {
            inner: MemorySessionStore::new(),
            first_seen: dashmap::DashMap::new(),
        });
        let f = fixture_with(store.clone()).await;
        register(&f, "alice").await;
        let tokens = login_tokens(&f, "alice").await;

        f.auth.refresh(&tokens.refresh_token).await.unwrap();
        let err = f.auth.refresh(&tokens.refresh_token).await.unwrap_err();
        assert!(matches!(err, DotMacError::InvalidToken { .. }));

        // The losing request ends the session
        let claims = f.auth.jwt.verify(&tokens.refresh_token, TokenType::Refresh).unwrap();
        assert!(store.inner.get(&claims.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logout_revokes_access_token() {
        let f = fixture().await;
        register(&f, "alice").await;
        let tokens = login_tokens(&f, "alice").await;
        let ctx = f.auth.authenticate(&tokens.access_token).await.unwrap();

        f.auth.logout(&ctx).await.unwrap();
        assert!(f.auth.authenticate(&tokens.access_token).await.is_err());
        assert!(f.auth.refresh(&tokens.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_logout_all_ends_every_session() {
        let f = fixture().await;
        register(&f, "alice").await;
        let a = login_tokens(&f, "alice").await;
        let b = login_tokens(&f, "alice").await;

        let ctx = f.auth.authenticate(&a.access_token).await.unwrap();
        assert_eq!(f.auth.logout_all(&ctx).await.unwrap(), 2);
        assert!(f.auth.authenticate(&b.access_token).await.is_err());
    }

    #[tokio::test]
    async fn test_mfa_flow_with_totp_and_backup_code() {
        let f = fixture().await;
        let user = register(&f, "alice").await;

        let setup = f.auth.setup_mfa(user.id).await.unwrap();
        assert!(setup.provisioning_uri.starts_with("otpauth://totp/"));

        let err = f
            .auth
            .confirm_mfa(&ExecutionContext::system(), user.id, "12345")
            .await
            .unwrap_err();
        assert!(matches!(err, DotMacError::InvalidMfaCode));

        let code = f.mfa.code_at(&setup.secret, now()).unwrap();
        let backup = f
            .auth
            .confirm_mfa(&ExecutionContext::system(), user.id, &code)
            .await
            .unwrap();
        assert_eq!(backup.len(), 10);

        let outcome = f.auth.login(f.tenant, "alice", PASSWORD, ClientInfo::default()).await.unwrap();
        let challenge = match outcome {
            LoginOutcome::MfaRequired { challenge_token, .. } => challenge_token,
            other => panic!("expected MFA challenge, got {:?}", other),
        };

        let (_, tokens) = f
            .auth
            .complete_mfa_login(&challenge, &backup[0], ClientInfo::default())
            .await
            .unwrap();
        assert!(f.auth.authenticate(&tokens.access_token).await.is_ok());

        // Challenge is single use
        assert!(f.auth.complete_mfa_login(&challenge, &backup[1], ClientInfo::default()).await.is_err());

        // Backup code is single use
        let outcome = f.auth.login(f.tenant, "alice", PASSWORD, ClientInfo::default()).await.unwrap();
        let challenge = match outcome {
            LoginOutcome::MfaRequired { challenge_token, .. } => challenge_token,
            other => panic!("expected MFA challenge, got {:?}", other),
        };
        let err = f
            .auth
            .complete_mfa_login(&challenge, &backup[0], ClientInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DotMacError::InvalidMfaCode));

        let code = f.mfa.code_at(&setup.secret, now()).unwrap();
        f.auth
            .disable_mfa(&ExecutionContext::system(), user.id, PASSWORD, &code)
            .await
            .unwrap();
        login_tokens(&f, "alice").await;
    }

    #[tokio::test]
    async fn test_disabled_user_cannot_login() {
        let f = fixture().await;
        let mut user = register(&f, "alice").await;
        user.deactivate();
        f.auth.users.update(&user).await.unwrap();

        let err = f.auth.login(f.tenant, "alice", PASSWORD, ClientInfo::default()).await.unwrap_err();
        assert!(matches!(err, DotMacError::AccountDisabled));
    }

    #[tokio::test]
    async fn test_ensure_admin_is_superuser() {
        let f = fixture().await;
        let input = RegisterInput {
            tenant_id: f.tenant,
            username: "root".to_string(),
            email: "root@example.com".to_string(),
            password: PASSWORD.to_string(),
            full_name: None,
        };
        let admin = f.auth.ensure_admin(input.clone()).await.unwrap();
        let again = f.auth.ensure_admin(input).await.unwrap();
        assert_eq!(admin.id, again.id);

        let perms = f.rbac.effective_permissions(admin.id).await.unwrap();
        assert!(perms.is_superuser());
    }
}
