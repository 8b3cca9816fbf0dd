//! Login sessions and token revocation

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    /// jti of the refresh token currently valid for this session
    pub refresh_jti: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Session {
    pub fn new(user_id: Uuid, tenant_id: Uuid, ttl_secs: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            tenant_id,
            refresh_jti: String::new(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs as i64),
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn ttl_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(1) as u64
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or replace
    async fn save(&self, session: &Session) -> Result<()>;

    /// Expired sessions are reported as missing
    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Returns the number of sessions removed
    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize>;

    /// Mark a token id as revoked until it would have expired anyway.
    /// Returns false when it was already revoked, so of several concurrent
    /// callers exactly one sees true.
    async fn revoke_token(&self, jti: &str, ttl_secs: u64) -> Result<bool>;

    async fn is_revoked(&self, jti: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    revoked: DashMap<String, DateTime<Utc>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let now = Utc::now();
        let session = self.sessions.get(session_id).map(|s| s.clone());
        match session {
            Some(s) if s.is_expired(now) => {
                self.sessions.remove(session_id);
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let mut removed = 0;
        self.sessions.retain(|_, s| {
            let keep = s.user_id != user_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    async fn revoke_token(&self, jti: &str, ttl_secs: u64) -> Result<bool> {
        let now = Utc::now();
        // Opportunistic cleanup of entries past their token's lifetime
        self.revoked.retain(|_, until| *until > now);
        let until = now + Duration::seconds(ttl_secs.max(1) as i64);
        let revoked_here = match self.revoked.entry(jti.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(until);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(until);
                true
            }
        };
        Ok(revoked_here)
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        Ok(self
            .revoked
            .get(jti)
            .is_some_and(|until| *until > Utc::now()))
    }
}

/// Sessions as JSON under `{prefix}:session:{id}`, indexed per user in a set,
/// revoked token ids as expiring marker keys.
pub struct RedisSessionStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn user_key(&self, user_id: Uuid) -> String {
        format!("{}:user_sessions:{}", self.prefix, user_id)
    }

    fn revoked_key(&self, jti: &str) -> String {
        format!("{}:revoked:{}", self.prefix, jti)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let payload = serde_json::to_string(session)?;
        let ttl = session.ttl_secs();
        let user_key = self.user_key(session.user_id);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.session_key(&session.id))
            .arg(payload)
            .arg("EX")
            .arg(ttl)
            .ignore()
            .cmd("SADD")
            .arg(&user_key)
            .arg(&session.id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&user_key)
            .arg(ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.session_key(session_id))
            .query_async(&mut conn)
            .await?;
        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let Some(session) = self.get(session_id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.session_key(session_id))
            .cmd("SREM")
            .arg(self.user_key(session.user_id))
            .arg(session_id)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn delete_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let user_key = self.user_key(user_id);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(&user_key)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut keys: Vec<String> = ids.iter().map(|id| self.session_key(id)).collect();
        keys.push(user_key);
        let removed: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
        // The index key itself is part of the count
        Ok((removed - 1).max(0) as usize)
    }

    async fn revoke_token(&self, jti: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        // NX replies nil when the marker already exists
        let set: Option<String> = redis::cmd("SET")
            .arg(self.revoked_key(jti))
            .arg(1)
            .arg("EX")
            .arg(ttl_secs.max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn is_revoked(&self, jti: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.revoked_key(jti))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }
}
