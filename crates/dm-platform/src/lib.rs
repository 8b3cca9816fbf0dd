//! DotMac Platform
//!
//! Core platform providing:
//! - Role-based access control with role hierarchy, expiring grants and
//!   an audit trail of every permission change
//! - Domain events dispatched in-process and bridged to an integration bus
//! - Password, JWT session and TOTP multi-factor authentication
//! - Redis-backed cache, distributed lock and rate limiting
//! - Nominatim geocoding
//! - REST APIs for all of the above

pub mod api;
pub mod domain;
pub mod error;
pub mod events;
pub mod infra;
pub mod repository;
pub mod service;

pub use domain::*;
pub use error::{DotMacError, Result};
