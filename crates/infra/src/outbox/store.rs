//! Transactional outbox storage.
//!
//! Every appended event leaves behind one outbox entry, written in the same
//! atomic unit as the event itself. The relay drains entries in `position`
//! order and marks them published; entries that keep failing are parked as
//! dead-lettered so one poisoned message cannot block the queue forever.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use fakturo_core::{AggregateId, TenantId};

use crate::event_store::EventStoreError;

/// A publication obligation recorded alongside an appended event.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Global, monotonically increasing drain position.
    ///
    /// Assigned at append time, so draining in position order preserves
    /// per-aggregate event order.
    pub position: u64,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    /// Identifies the entry; exactly one entry exists per appended event.
    pub event_id: Uuid,
    pub event_type: String,
    /// The serialized bus envelope, exactly as it will be published.
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Set once the entry has been handed to the bus.
    pub published_at: Option<DateTime<Utc>>,
    /// Parked after exhausting all publish attempts; excluded from draining.
    pub dead_lettered: bool,
}

impl OutboxEntry {
    /// Whether the entry still awaits publication.
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none() && !self.dead_lettered
    }
}

/// Storage operations the outbox relay drives.
///
/// Implemented by the event store backends, since outbox rows live in the
/// same storage as the streams they were appended with.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Pending entries (unpublished, not dead-lettered) in position order.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>, EventStoreError>;

    /// Mark an entry as successfully published.
    async fn mark_published(&self, event_id: Uuid) -> Result<(), EventStoreError>;

    /// Record a failed publish attempt; returns the updated attempt count.
    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<u32, EventStoreError>;

    /// Park an entry permanently after its attempts are exhausted.
    async fn mark_dead_lettered(&self, event_id: Uuid) -> Result<(), EventStoreError>;

    /// Dead-lettered entries in position order, for operator inspection.
    async fn fetch_dead_lettered(&self, limit: usize)
    -> Result<Vec<OutboxEntry>, EventStoreError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>, EventStoreError> {
        (**self).fetch_unpublished(limit).await
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        (**self).mark_published(event_id).await
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<u32, EventStoreError> {
        (**self).record_failure(event_id, error).await
    }

    async fn mark_dead_lettered(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        (**self).mark_dead_lettered(event_id).await
    }

    async fn fetch_dead_lettered(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, EventStoreError> {
        (**self).fetch_dead_lettered(limit).await
    }
}
