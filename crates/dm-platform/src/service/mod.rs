//! Service Layer
//!
//! Business logic: RBAC resolution and administration, authentication
//! (passwords, JWT, sessions, MFA) and geocoding.

pub mod auth;
pub mod authorization;
pub mod geocoding;
pub mod jwt;
pub mod mfa;
pub mod password;
pub mod rbac;
pub mod session;

pub use auth::{AuthService, ClientInfo, LockoutPolicy, LoginOutcome, MfaSetup, RegisterInput};
pub use authorization::AuthContext;
pub use geocoding::{GeoPoint, GeocodingService, ReverseGeocode};
pub use jwt::{extract_bearer_token, Claims, JwtConfig, JwtService, TokenPair, TokenSubject, TokenType};
pub use mfa::MfaService;
pub use password::{PasswordPolicy, PasswordService};
pub use rbac::{
    BootstrapReport, CreateRoleInput, EffectivePermissions, ExpiryReport, RbacService, UpdateRoleInput,
};
pub use session::{MemorySessionStore, RedisSessionStore, Session, SessionStore};
