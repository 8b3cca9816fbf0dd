//! Publishes domain events in-process and bridges them to the integration bus.

use std::sync::Arc;
use tracing::warn;

use crate::events::{
    DispatchReport, DomainEvent, DomainEventDispatcher, EventBus, EventEnvelope, IntegrationEvent,
};

#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub dispatch: DispatchReport,
    /// Whether the event was handed to the bus successfully
    pub bridged: bool,
    pub bus_error: Option<String>,
}

pub struct DomainEventPublisher {
    dispatcher: Arc<DomainEventDispatcher>,
    bus: Option<Arc<dyn EventBus>>,
    source: String,
    bridge_prefixes: Vec<String>,
}

impl DomainEventPublisher {
    pub fn new(dispatcher: Arc<DomainEventDispatcher>, source: impl Into<String>) -> Self {
        Self {
            dispatcher,
            bus: None,
            source: source.into(),
            bridge_prefixes: Vec::new(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Only event types starting with one of these prefixes are bridged.
    /// Empty bridges everything.
    pub fn with_bridge_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.bridge_prefixes = prefixes;
        self
    }

    pub fn dispatcher(&self) -> &Arc<DomainEventDispatcher> {
        &self.dispatcher
    }

    pub fn should_bridge(&self, event_type: &str) -> bool {
        self.bridge_prefixes.is_empty()
            || self.bridge_prefixes.iter().any(|p| event_type.starts_with(p.as_str()))
    }

    pub async fn publish(&self, event: &dyn DomainEvent) -> PublishOutcome {
        self.publish_envelope(&EventEnvelope::from_event(event)).await
    }

    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> PublishOutcome {
        let dispatch = self.dispatcher.dispatch(envelope).await;
        let mut outcome = PublishOutcome {
            dispatch,
            ..Default::default()
        };

        let Some(bus) = &self.bus else {
            return outcome;
        };
        if !self.should_bridge(envelope.event_type()) {
            return outcome;
        }

        let integration = IntegrationEvent::from_envelope(envelope, &self.source);
        match bus.publish(&integration).await {
            Ok(()) => outcome.bridged = true,
            Err(e) => {
                warn!(
                    bus = bus.name(),
                    event_type = %envelope.event_type(),
                    event_id = %envelope.metadata.event_id,
                    error = %e,
                    "Failed to bridge event to integration bus"
                );
                outcome.bus_error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Publish in order, typically the drained events of an aggregate
    pub async fn publish_all(&self, envelopes: Vec<EventEnvelope>) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(envelopes.len());
        for envelope in &envelopes {
            outcomes.push(self.publish_envelope(envelope).await);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DotMacError, Result};
    use crate::events::{handler_fn, EventMetadata, ExecutionContext, InMemoryEventBus};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBus;

    #[async_trait]
    impl EventBus for FailingBus {
        async fn publish(&self, _event: &IntegrationEvent) -> Result<()> {
            Err(DotMacError::external("bus", "unreachable"))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            metadata: EventMetadata::new(&ExecutionContext::system(), event_type, "user", "u-1"),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_dispatches_then_bridges() {
        let dispatcher = Arc::new(DomainEventDispatcher::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        dispatcher.subscribe(
            "auth.*",
            handler_fn("count", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let bus = Arc::new(InMemoryEventBus::default());
        let mut rx = bus.subscribe();
        let publisher = DomainEventPublisher::new(dispatcher, "platform").with_bus(bus);

        let outcome = publisher.publish_envelope(&envelope("auth.user.logged_in")).await;
        assert_eq!(outcome.dispatch.handled, 1);
        assert!(outcome.bridged);
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, "auth.user.logged_in");
        assert_eq!(received.source, "platform");
    }

    #[tokio::test]
    async fn test_bridge_prefix_filter() {
        let bus = Arc::new(InMemoryEventBus::default());
        let publisher = DomainEventPublisher::new(Arc::new(DomainEventDispatcher::new()), "p")
            .with_bus(bus)
            .with_bridge_prefixes(vec!["rbac.".to_string()]);

        assert!(publisher.should_bridge("rbac.role.created"));
        assert!(!publisher.should_bridge("auth.user.logged_in"));

        let outcome = publisher.publish_envelope(&envelope("auth.user.logged_in")).await;
        assert!(!outcome.bridged);
        assert!(outcome.bus_error.is_none());
    }

    #[tokio::test]
    async fn test_bus_failure_is_reported_not_propagated() {
        let publisher = DomainEventPublisher::new(Arc::new(DomainEventDispatcher::new()), "p")
            .with_bus(Arc::new(FailingBus));

        let outcome = publisher.publish_envelope(&envelope("rbac.role.created")).await;
        assert!(!outcome.bridged);
        assert!(outcome.bus_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_publish_all_preserves_order() {
        let bus = Arc::new(InMemoryEventBus::default());
        let mut rx = bus.subscribe();
        let publisher =
            DomainEventPublisher::new(Arc::new(DomainEventDispatcher::new()), "p").with_bus(bus);

        let outcomes = publisher
            .publish_all(vec![envelope("a.b.first"), envelope("a.b.second")])
            .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(rx.recv().await.unwrap().event_type, "a.b.first");
        assert_eq!(rx.recv().await.unwrap().event_type, "a.b.second");
    }
}
