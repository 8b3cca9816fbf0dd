//! Infrastructure
//!
//! Cache, distributed lock and rate limiting, each with a Redis backend
//! and an in-process one for single-node deployments and tests.

pub mod cache;
pub mod lock;
pub mod rate_limit;

pub use cache::{get_json, set_json, CacheBackend, MemoryCache, RedisCache};
pub use lock::{DistributedLock, LockBackend, LockGuard, MemoryLockBackend, RedisLockBackend};
pub use rate_limit::{client_key, rate_limit_middleware, ClientRateLimiter};
