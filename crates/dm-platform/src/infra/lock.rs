//! Distributed locks
//!
//! A lock is a key holding a random token with a TTL. Only the holder of
//! the token can release it, so an expired lock taken over by another
//! process is never released by the original owner.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::Script;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DotMacError, Result};

/// Delete the key only if it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Set `key` to `token` if absent. Returns whether the lock was taken.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key` if it holds `token`. Returns whether it did.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryLockBackend {
    locks: DashMap<String, (String, Instant)>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| (String::new(), now));
        let (holder, expires) = entry.value_mut();
        if !holder.is_empty() && *expires > now {
            return Ok(false);
        }
        *holder = token.to_string();
        *expires = now + ttl;
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .locks
            .remove_if(key, |_, (holder, expires)| holder == token && *expires > now)
            .is_some())
    }
}

pub struct RedisLockBackend {
    conn: ConnectionManager,
    prefix: String,
    release: Script,
}

impl RedisLockBackend {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:lock:{}", self.prefix, key)
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(self.key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}

/// Proof of holding a lock. Pass it back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
    pub expires_at: Instant,
}

impl LockGuard {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryLockBackend::new()))
    }

    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>> {
        if ttl.is_zero() {
            return Err(DotMacError::validation("Lock TTL must be positive"));
        }
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();
        if self.backend.try_lock(key, &token, ttl).await? {
            debug!(key, "Lock acquired");
            Ok(Some(LockGuard {
                key: key.to_string(),
                token,
                expires_at: started + ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry until the lock is taken or `wait` elapses
    pub async fn acquire(&self, key: &str, ttl: Duration, wait: Duration) -> Result<Option<LockGuard>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(guard) = self.try_acquire(key, ttl).await? {
                return Ok(Some(guard));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, "Timed out waiting for lock");
                return Ok(None);
            }
            tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Returns false when the lock had already expired or changed hands
    pub async fn release(&self, guard: LockGuard) -> Result<bool> {
        let released = self.backend.unlock(&guard.key, &guard.token).await?;
        if !released {
            warn!(key = %guard.key, "Lock was no longer held at release");
        }
        Ok(released)
    }

    /// Run `f` while holding the lock; `None` when it could not be taken
    pub async fn with_lock<F, Fut, T>(&self, key: &str, ttl: Duration, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let Some(guard) = self.try_acquire(key, ttl).await? else {
            return Ok(None);
        };
        let outcome = f().await;
        self.release(guard).await?;
        outcome.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let lock = DistributedLock::in_memory();
        let ttl = Duration::from_secs(10);

        let guard = lock.try_acquire("job", ttl).await.unwrap().unwrap();
        assert!(lock.try_acquire("job", ttl).await.unwrap().is_none());
        assert!(lock.try_acquire("other", ttl).await.unwrap().is_some());

        assert!(lock.release(guard).await.unwrap());
        assert!(lock.try_acquire("job", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_and_not_released_by_old_holder() {
        let lock = DistributedLock::in_memory();
        let old = lock
            .try_acquire("job", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(old.is_expired());

        let new = lock
            .try_acquire("job", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!lock.release(old).await.unwrap());
        assert!(lock.release(new).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_expiry() {
        let lock = DistributedLock::in_memory();
        let _held = lock
            .try_acquire("job", Duration::from_millis(60))
            .await
            .unwrap()
            .unwrap();

        let short = lock
            .acquire("job", Duration::from_secs(1), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(short.is_none());

        let waited = lock
            .acquire("job", Duration::from_secs(1), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(waited.is_some());
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let lock = DistributedLock::in_memory();
        assert!(lock.try_acquire("job", Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_with_lock() {
        let lock = DistributedLock::in_memory();
        let value = lock
            .with_lock("job", Duration::from_secs(5), || async { Ok(42) })
            .await
            .unwrap();
        assert_eq!(value, Some(42));
        assert!(lock.try_acquire("job", Duration::from_secs(5)).await.unwrap().is_some());
    }
}
