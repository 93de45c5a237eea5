//! Event records as they travel into and out of the store.
//!
//! An aggregate decides [`UncommittedEvent`]s; the store assigns each one a
//! per-stream sequence number and hands back [`StoredEvent`]s. The stored form
//! carries everything needed to rebuild the bus envelope without consulting
//! the domain crate, so the outbox relay can republish events it cannot even
//! deserialize.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use fakturo_core::{AggregateId, TenantId};
use fakturo_events::{Event, EventEnvelope, EventMetadata};

/// Failures raised by event store operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The expected stream version did not match the stored stream.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// An operation crossed a tenant boundary.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// A stream was addressed with the wrong aggregate type.
    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    /// The append batch or the stored stream failed a structural check.
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// An event payload could not be serialized.
    #[error("event serialization failed: {0}")]
    Serialization(String),

    /// The underlying storage failed (connection, lock, IO).
    #[error("event store failure: {0}")]
    Storage(String),
}

/// An event decided by an aggregate but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Build a record from a typed domain event.
    ///
    /// Mints a fresh UUIDv7 event id; retried command attempts therefore
    /// produce distinct event identities.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event: &E,
        correlation_id: Uuid,
        causation_id: Option<Uuid>,
    ) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.version(),
            occurred_at: event.occurred_at(),
            correlation_id,
            causation_id,
            payload,
        })
    }
}

/// An event as persisted in a stream, with its assigned sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub sequence_number: u64,
    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn from_uncommitted(event: UncommittedEvent, sequence_number: u64) -> Self {
        Self {
            event_id: event.event_id,
            tenant_id: event.tenant_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            sequence_number,
            event_type: event.event_type,
            schema_version: event.schema_version,
            occurred_at: event.occurred_at,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            payload: event.payload,
        }
    }

    /// Rebuild the bus envelope for this record.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        let metadata = EventMetadata::new(
            self.event_type.clone(),
            self.schema_version,
            self.occurred_at,
            self.correlation_id,
            self.causation_id,
        );

        EventEnvelope::new(
            self.event_id,
            self.tenant_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            metadata,
            self.payload.clone(),
        )
    }
}

/// Check append-batch uniformity; returns the batch's tenant, aggregate and
/// aggregate type.
///
/// An append targets exactly one stream, so every record must agree on all
/// three. The empty batch is rejected rather than silently accepted.
pub(crate) fn validate_batch(
    events: &[UncommittedEvent],
) -> Result<(TenantId, AggregateId, &str), EventStoreError> {
    let first = events
        .first()
        .ok_or_else(|| EventStoreError::InvalidAppend("empty append batch".to_string()))?;

    for (idx, event) in events.iter().enumerate() {
        if event.tenant_id != first.tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "append batch mixes tenants at index {idx}"
            )));
        }
        if event.aggregate_id != first.aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "append batch mixes aggregates at index {idx}"
            )));
        }
        if event.aggregate_type != first.aggregate_type {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "append batch mixes aggregate types at index {idx}"
            )));
        }
    }

    Ok((first.tenant_id, first.aggregate_id, &first.aggregate_type))
}

/// Validate a loaded stream: uniform ownership and a contiguous 1-based
/// sequence. A violation means the store is corrupt or was queried across a
/// tenant boundary, so rehydration must not proceed.
pub(crate) fn validate_stream(
    tenant_id: TenantId,
    aggregate_id: AggregateId,
    events: &[StoredEvent],
) -> Result<(), EventStoreError> {
    for (idx, event) in events.iter().enumerate() {
        if event.tenant_id != tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "stream {aggregate_id} holds an event owned by tenant {}",
                event.tenant_id
            )));
        }
        if event.aggregate_id != aggregate_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {aggregate_id} holds an event for aggregate {}",
                event.aggregate_id
            )));
        }

        let expected = idx as u64 + 1;
        if event.sequence_number != expected {
            return Err(EventStoreError::InvalidAppend(format!(
                "stream {aggregate_id} is not contiguous: expected sequence {expected}, found {}",
                event.sequence_number
            )));
        }
    }

    Ok(())
}
