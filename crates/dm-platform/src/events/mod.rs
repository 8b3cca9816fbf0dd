//! Domain events, in-process dispatch and the integration bus bridge

pub mod domain_event;
pub mod dispatcher;
pub mod bus;
pub mod publisher;
pub mod rbac;
pub mod auth;

pub use domain_event::{AggregateRoot, DomainEvent, EventEnvelope, EventMetadata, ExecutionContext};
pub use dispatcher::{
    handler_fn, DispatchReport, DomainEventDispatcher, DomainEventHandler, FnHandler,
    HandlerFailure, LoggingHandler, ALL_EVENTS,
};
pub use bus::{EventBus, InMemoryEventBus, IntegrationEvent, RedisEventBus};
pub use publisher::{DomainEventPublisher, PublishOutcome};
