//! Domain Event Trait
//!
//! Base trait for all domain events. Events are facts about what happened
//! in the domain, named in past tense.
//!
//! # Event Type Format
//!
//! `{domain}.{aggregate}.{action}`, e.g. `rbac.user.role_assigned`
//!
//! # Aggregate Identity
//!
//! Each event names the aggregate it belongs to (`role`, `user`) and that
//! aggregate's id, so consumers can order and group events per aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who is executing a use case, and under which correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub correlation_id: String,
    pub principal_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

impl ExecutionContext {
    /// Context for actions performed by the platform itself
    pub fn system() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            principal_id: None,
            tenant_id: None,
        }
    }

    pub fn for_principal(principal_id: Uuid, tenant_id: Option<Uuid>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            principal_id: Some(principal_id),
            tenant_id,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }
}

/// Common metadata for domain events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn new(
        ctx: &ExecutionContext,
        event_type: &str,
        aggregate_type: &str,
        aggregate_id: impl ToString,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            tenant_id: ctx.tenant_id,
            occurred_at: Utc::now(),
            correlation_id: ctx.correlation_id.clone(),
            principal_id: ctx.principal_id,
        }
    }
}

/// Base trait for all domain events.
pub trait DomainEvent: Send + Sync {
    fn metadata(&self) -> &EventMetadata;

    /// Event-specific data
    fn payload(&self) -> serde_json::Value;

    fn event_id(&self) -> Uuid {
        self.metadata().event_id
    }

    fn event_type(&self) -> &str {
        &self.metadata().event_type
    }

    fn aggregate_id(&self) -> &str {
        &self.metadata().aggregate_id
    }

    fn tenant_id(&self) -> Option<Uuid> {
        self.metadata().tenant_id
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata().occurred_at
    }

    fn correlation_id(&self) -> &str {
        &self.metadata().correlation_id
    }

    fn principal_id(&self) -> Option<Uuid> {
        self.metadata().principal_id
    }
}

/// Implements [`DomainEvent`] for a struct with a `#[serde(skip)] metadata: EventMetadata`
/// field; the remaining serialized fields form the payload.
#[macro_export]
macro_rules! impl_domain_event {
    ($event_type:ty) => {
        impl $crate::events::DomainEvent for $event_type {
            fn metadata(&self) -> &$crate::events::EventMetadata {
                &self.metadata
            }

            fn payload(&self) -> serde_json::Value {
                serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
            }
        }
    };
}

/// Owned, serializable form of any domain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn from_event(event: &dyn DomainEvent) -> Self {
        Self {
            metadata: event.metadata().clone(),
            payload: event.payload(),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.metadata.event_type
    }
}

/// Entities that record domain events while they change, to be published
/// once the change is persisted.
pub trait AggregateRoot {
    fn aggregate_type() -> &'static str
    where
        Self: Sized;

    fn pending_events(&mut self) -> &mut Vec<EventEnvelope>;

    fn record(&mut self, event: &dyn DomainEvent) {
        self.pending_events().push(EventEnvelope::from_event(event));
    }

    /// Drain recorded events
    fn take_events(&mut self) -> Vec<EventEnvelope> {
        std::mem::take(self.pending_events())
    }
}
