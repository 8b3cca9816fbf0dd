//! Domain Models
//!
//! RBAC schema: users have roles, roles have permissions, users may carry
//! direct permission overrides, and every change is recorded as a grant.

pub mod permission;
pub mod role;
pub mod user;
pub mod grant;

pub use permission::*;
pub use role::*;
pub use user::*;
pub use grant::*;
