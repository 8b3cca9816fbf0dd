//! Integration event bus
//!
//! Domain events that leave the process are wrapped as [`IntegrationEvent`]s
//! and published on a bus. The in-memory bus serves tests and single-node
//! deployments; the Redis bus publishes to `{prefix}.{event_type}` channels.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::error::{DotMacError, Result};
use crate::events::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    /// Same id as the originating domain event
    pub id: Uuid,
    pub event_type: String,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl IntegrationEvent {
    pub fn from_envelope(envelope: &EventEnvelope, source: &str) -> Self {
        let m = &envelope.metadata;
        Self {
            id: m.event_id,
            event_type: m.event_type.clone(),
            source: source.to_string(),
            tenant_id: m.tenant_id,
            correlation_id: m.correlation_id.clone(),
            occurred_at: m.occurred_at,
            data: serde_json::json!({
                "aggregateType": m.aggregate_type,
                "aggregateId": m.aggregate_id,
                "principalId": m.principal_id,
                "payload": envelope.payload,
            }),
        }
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Broadcast-channel bus. Publishing with no subscribers is not an error.
pub struct InMemoryEventBus {
    sender: broadcast::Sender<IntegrationEvent>,
}

impl InMemoryEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntegrationEvent> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        match self.sender.send(event.clone()) {
            Ok(receivers) => {
                debug!(event_type = %event.event_type, receivers, "Published integration event");
            }
            Err(_) => {
                debug!(event_type = %event.event_type, "No bus subscribers");
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct RedisEventBus {
    conn: ConnectionManager,
    channel_prefix: String,
}

impl RedisEventBus {
    pub fn new(conn: ConnectionManager, channel_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            channel_prefix: channel_prefix.into(),
        }
    }

    pub fn channel_for(&self, event_type: &str) -> String {
        format!("{}.{}", self.channel_prefix, event_type)
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &IntegrationEvent) -> Result<()> {
        let channel = self.channel_for(&event.event_type);
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| DotMacError::external("redis-event-bus", e.to_string()))?;
        debug!(channel = %channel, receivers, "Published integration event");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
