//! In-process domain event dispatcher
//!
//! Handlers subscribe by exact event type, by prefix wildcard (`rbac.*`) or
//! to everything (`*`). Matching handlers run concurrently and a failing
//! handler never prevents the others from running.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::EventEnvelope;

/// Subscription key matching every event
pub const ALL_EVENTS: &str = "*";

#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Unique name used for unsubscription and failure reports
    fn name(&self) -> &str;

    async fn handle(&self, event: &EventEnvelope) -> Result<()>;
}

/// Adapter turning an async closure into a handler
pub struct FnHandler<F> {
    name: String,
    f: F,
}

pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<FnHandler<F>>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

#[async_trait]
impl<F, Fut> DomainEventHandler for FnHandler<F>
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Logs every event it sees
pub struct LoggingHandler;

#[async_trait]
impl DomainEventHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        info!(
            event_id = %event.metadata.event_id,
            event_type = %event.metadata.event_type,
            aggregate_id = %event.metadata.aggregate_id,
            correlation_id = %event.metadata.correlation_id,
            "Domain event"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Handlers that completed successfully
    pub handled: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
pub struct DomainEventDispatcher {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn DomainEventHandler>>>>,
}

impl DomainEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: impl Into<String>, handler: Arc<dyn DomainEventHandler>) {
        let key = key.into();
        debug!(key = %key, handler = handler.name(), "Subscribing event handler");
        self.handlers.write().entry(key).or_default().push(handler);
    }

    /// Returns true if a handler with that name was registered under `key`
    pub fn unsubscribe(&self, key: &str, handler_name: &str) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|h| h.name() != handler_name);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(key);
        }
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }

    fn key_matches(key: &str, event_type: &str) -> bool {
        if key == ALL_EVENTS || key == event_type {
            return true;
        }
        match key.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('.') => event_type.starts_with(prefix),
            _ => false,
        }
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn DomainEventHandler>> {
        self.handlers
            .read()
            .iter()
            .filter(|(key, _)| Self::key_matches(key, event_type))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect()
    }

    pub async fn dispatch(&self, event: &EventEnvelope) -> DispatchReport {
        // Snapshot so no lock is held across handler awaits
        let handlers = self.handlers_for(event.event_type());
        if handlers.is_empty() {
            debug!(event_type = %event.event_type(), "No handlers for event");
            return DispatchReport::default();
        }

        let results = join_all(handlers.iter().map(|h| async move {
            (h.name().to_string(), h.handle(event).await)
        }))
        .await;

        let mut report = DispatchReport::default();
        for (handler, result) in results {
            match result {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    warn!(
                        handler = %handler,
                        event_type = %event.event_type(),
                        error = %e,
                        "Event handler failed"
                    );
                    report.failures.push(HandlerFailure {
                        handler,
                        error: e.to_string(),
                    });
                }
            }
        }

        metrics::counter!(
            "dm_domain_events_dispatched_total",
            "event_type" => event.event_type().to_string()
        )
        .increment(1);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DotMacError;
    use crate::events::{EventMetadata, ExecutionContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope {
            metadata: EventMetadata::new(&ExecutionContext::system(), event_type, "test", "1"),
            payload: serde_json::json!({}),
        }
    }

    fn counting(name: &str, counter: Arc<AtomicUsize>) -> Arc<dyn DomainEventHandler> {
        handler_fn(name, move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_exact_prefix_and_wildcard_subscriptions() {
        let dispatcher = DomainEventDispatcher::new();
        let exact = Arc::new(AtomicUsize::new(0));
        let prefix = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe("rbac.user.role_assigned", counting("exact", exact.clone()));
        dispatcher.subscribe("rbac.*", counting("prefix", prefix.clone()));
        dispatcher.subscribe(ALL_EVENTS, counting("all", all.clone()));

        let report = dispatcher.dispatch(&envelope("rbac.user.role_assigned")).await;
        assert_eq!(report.handled, 3);

        dispatcher.dispatch(&envelope("rbac.role.created")).await;
        dispatcher.dispatch(&envelope("auth.user.logged_in")).await;

        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(prefix.load(Ordering::SeqCst), 2);
        assert_eq!(all.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_prefix_requires_segment_boundary() {
        let dispatcher = DomainEventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("rbac.*", counting("prefix", count.clone()));

        dispatcher.dispatch(&envelope("rbacx.role.created")).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_others() {
        let dispatcher = DomainEventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe(
            "test.thing.happened",
            handler_fn("broken", |_| async { Err(DotMacError::internal("handler exploded")) }),
        );
        dispatcher.subscribe("test.thing.happened", counting("healthy", count.clone()));

        let report = dispatcher.dispatch(&envelope("test.thing.happened")).await;
        assert_eq!(report.handled, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].handler, "broken");
        assert!(!report.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let dispatcher = DomainEventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        dispatcher.subscribe("a.b.c", counting("h1", count.clone()));
        dispatcher.subscribe("a.b.c", Arc::new(LoggingHandler));
        assert_eq!(dispatcher.handler_count(), 2);

        assert!(dispatcher.unsubscribe("a.b.c", "h1"));
        assert!(!dispatcher.unsubscribe("a.b.c", "h1"));
        assert!(!dispatcher.unsubscribe("x.y.z", "logging"));
        assert_eq!(dispatcher.handler_count(), 1);

        dispatcher.dispatch(&envelope("a.b.c")).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_handlers() {
        let dispatcher = DomainEventDispatcher::new();
        let report = dispatcher.dispatch(&envelope("nobody.listens.here")).await;
        assert_eq!(report.handled, 0);
        assert!(report.is_success());
    }
}
