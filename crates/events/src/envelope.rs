use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fakturo_core::{AggregateId, TenantId};

use crate::event::Event;

/// Descriptive metadata attached to every enveloped event.
///
/// Mirrors the bus message schema: consumers deduplicate by event id and can
/// trace a fact back to the command that caused it via
/// `correlation_id`/`causation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    event_type: String,
    schema_version: u32,
    occurred_at: DateTime<Utc>,
    correlation_id: Uuid,
    causation_id: Option<Uuid>,
}

impl EventMetadata {
    pub fn new(
        event_type: impl Into<String>,
        schema_version: u32,
        occurred_at: DateTime<Utc>,
        correlation_id: Uuid,
        causation_id: Option<Uuid>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version,
            occurred_at,
            correlation_id,
            causation_id,
        }
    }

    /// Build metadata from a typed event payload.
    pub fn for_event<E: Event>(
        event: &E,
        correlation_id: Uuid,
        causation_id: Option<Uuid>,
    ) -> Self {
        Self::new(
            event.event_type(),
            event.version(),
            event.occurred_at(),
            correlation_id,
            causation_id,
        )
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }
}

/// Envelope for an event, containing multi-tenant + stream metadata.
///
/// This is the unit you persist to an event stream and publish to the bus.
///
/// Notes:
/// - **Multi-tenancy** is enforced here via `tenant_id`.
/// - **Append-only**: `sequence_number` is monotonically increasing per
///   `(tenant_id, aggregate_id)` stream, starting at 1.
/// - `payload` is the domain event; `metadata` describes it for consumers
///   that never deserialize the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    tenant_id: TenantId,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    #[serde(flatten)]
    metadata: EventMetadata,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: Uuid,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        metadata: EventMetadata,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            tenant_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            metadata,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn event_type(&self) -> &str {
        self.metadata.event_type()
    }

    pub fn schema_version(&self) -> u32 {
        self.metadata.schema_version()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.metadata.occurred_at()
    }

    pub fn correlation_id(&self) -> Uuid {
        self.metadata.correlation_id()
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.metadata.causation_id()
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Re-wrap the payload, keeping every piece of metadata.
    pub fn map_payload<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            event_id: self.event_id,
            tenant_id: self.tenant_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            metadata: self.metadata,
            payload: f(self.payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> EventMetadata {
        EventMetadata::new(
            "invoicing.invoice.created",
            1,
            Utc::now(),
            Uuid::now_v7(),
            None,
        )
    }

    #[test]
    fn envelope_exposes_flattened_metadata() {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            TenantId::new(),
            AggregateId::new(),
            "invoice",
            1,
            metadata(),
            serde_json::json!({"k": "v"}),
        );

        assert_eq!(envelope.event_type(), "invoicing.invoice.created");
        assert_eq!(envelope.schema_version(), 1);
        assert!(envelope.causation_id().is_none());
    }

    #[test]
    fn metadata_serializes_at_the_top_level() {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            TenantId::new(),
            AggregateId::new(),
            "invoice",
            3,
            metadata(),
            serde_json::json!({"k": "v"}),
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["event_type"], "invoicing.invoice.created");
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["sequence_number"], 3);
    }

    #[test]
    fn map_payload_keeps_identity() {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            TenantId::new(),
            AggregateId::new(),
            "invoice",
            2,
            metadata(),
            7u32,
        );
        let event_id = envelope.event_id();

        let mapped = envelope.map_payload(|n| n.to_string());
        assert_eq!(mapped.event_id(), event_id);
        assert_eq!(mapped.sequence_number(), 2);
        assert_eq!(mapped.payload(), "7");
    }
}
