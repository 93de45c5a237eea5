//! The event store contract.

use std::sync::Arc;

use async_trait::async_trait;

use fakturo_core::{AggregateId, ExpectedVersion, TenantId};

use super::record::{EventStoreError, StoredEvent, UncommittedEvent};

/// Append-only, tenant-partitioned event storage.
///
/// Each aggregate instance owns one stream, addressed by
/// `(tenant_id, aggregate_id)`. Sequence numbers are per-stream, start at 1
/// and never have gaps; the stream is the source of truth for the aggregate.
///
/// Implementations also enlist every appended event in the transactional
/// outbox within the same atomic unit as the append itself. Either the events
/// and their outbox rows are all durable, or none are; publication can then
/// never be lost between the store and the bus.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a batch of events to a single stream.
    ///
    /// The batch must be non-empty and uniform in tenant, aggregate and
    /// aggregate type. `expected_version` is the optimistic concurrency
    /// check: [`ExpectedVersion::Exact`] must equal the stream's current
    /// highest sequence (0 for a new stream) or the append is rejected with
    /// [`EventStoreError::Concurrency`] and nothing is written.
    ///
    /// On success the batch is committed atomically, in order, together with
    /// one outbox entry per event.
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Load a full stream in sequence order.
    ///
    /// Returns an empty vector for a stream that does not exist. The loaded
    /// stream is validated for contiguity and ownership before it is handed
    /// back.
    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Atomically allocate the next value of a named per-tenant counter.
    ///
    /// Counters are keyed by `(tenant_id, scope)`, start at 1 and increase by
    /// exactly one per call even under concurrent allocation. Used for
    /// document numbering, where the scope is the fiscal period.
    async fn next_sequence(&self, tenant_id: TenantId, scope: &str)
    -> Result<u64, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version).await
    }

    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load_stream(tenant_id, aggregate_id).await
    }

    async fn next_sequence(
        &self,
        tenant_id: TenantId,
        scope: &str,
    ) -> Result<u64, EventStoreError> {
        (**self).next_sequence(tenant_id, scope).await
    }
}
