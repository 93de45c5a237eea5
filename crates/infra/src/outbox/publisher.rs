//! Publication boundary between the outbox and downstream transport.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use fakturo_events::{EventBus, EventEnvelope};

/// A publish attempt failed. The relay treats every publish failure as
/// retryable; events are already durable, so republishing is always safe.
#[derive(Debug, Error)]
#[error("event publication failed: {0}")]
pub struct PublishError(pub String);

/// Destination for drained outbox entries.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), PublishError> {
        (**self).publish(envelope).await
    }
}

/// Publishes envelopes onto an [`EventBus`].
#[derive(Debug)]
pub struct BusEventPublisher<B> {
    bus: B,
}

impl<B> BusEventPublisher<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl<B> EventPublisher for BusEventPublisher<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    async fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), PublishError> {
        self.bus
            .publish(envelope)
            .map_err(|e| PublishError(format!("{e:?}")))
    }
}
