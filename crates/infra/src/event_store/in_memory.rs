//! In-memory event store with transactional outbox.
//!
//! Backs tests, benches and single-process development. One mutex guards the
//! whole state, so an append commits its events and their outbox entries as
//! one atomic unit, exactly like the Postgres backend does with a
//! transaction.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use fakturo_core::{AggregateId, ExpectedVersion, TenantId};

use crate::outbox::{OutboxEntry, OutboxStore};

use super::record::{
    EventStoreError, StoredEvent, UncommittedEvent, validate_batch, validate_stream,
};
use super::store::EventStore;

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<(TenantId, AggregateId), Vec<StoredEvent>>,
    /// Append-ordered, so iteration order equals position order.
    outbox: Vec<OutboxEntry>,
    last_position: u64,
    counters: HashMap<(TenantId, String), u64>,
}

/// In-memory [`EventStore`] + [`OutboxStore`].
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: Mutex<Inner>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, EventStoreError> {
        self.inner
            .lock()
            .map_err(|_| EventStoreError::Storage("event store lock poisoned".to_string()))
    }

    fn entry_mut(inner: &mut Inner, event_id: Uuid) -> Result<&mut OutboxEntry, EventStoreError> {
        inner
            .outbox
            .iter_mut()
            .find(|entry| entry.event_id == event_id)
            .ok_or_else(|| EventStoreError::Storage(format!("unknown outbox entry {event_id}")))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let (tenant_id, aggregate_id, aggregate_type) = validate_batch(&events)?;
        let aggregate_type = aggregate_type.to_string();
        let key = (tenant_id, aggregate_id);

        let mut inner = self.lock()?;

        let current_version = inner.streams.get(&key).map(|s| s.len() as u64).unwrap_or(0);
        expected_version
            .check(current_version)
            .map_err(|e| EventStoreError::Concurrency(e.to_string()))?;

        if let Some(first) = inner.streams.get(&key).and_then(|s| s.first())
            && first.aggregate_type != aggregate_type
        {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream {aggregate_id} holds {} events, append carries {aggregate_type}",
                first.aggregate_type
            )));
        }

        // Build both sides completely before touching state, so a failure
        // mid-batch leaves neither events nor outbox entries behind.
        let mut committed = Vec::with_capacity(events.len());
        let mut entries = Vec::with_capacity(events.len());
        let mut position = inner.last_position;
        for (offset, event) in events.into_iter().enumerate() {
            let stored = StoredEvent::from_uncommitted(event, current_version + offset as u64 + 1);
            let payload = serde_json::to_value(stored.to_envelope())
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

            position += 1;
            entries.push(OutboxEntry {
                position,
                tenant_id,
                aggregate_id,
                event_id: stored.event_id,
                event_type: stored.event_type.clone(),
                payload,
                created_at: Utc::now(),
                attempts: 0,
                last_error: None,
                published_at: None,
                dead_lettered: false,
            });
            committed.push(stored);
        }

        inner.last_position = position;
        inner
            .streams
            .entry(key)
            .or_default()
            .extend(committed.iter().cloned());
        inner.outbox.extend(entries);

        Ok(committed)
    }

    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let stream = {
            let inner = self.lock()?;
            inner
                .streams
                .get(&(tenant_id, aggregate_id))
                .cloned()
                .unwrap_or_default()
        };

        validate_stream(tenant_id, aggregate_id, &stream)?;
        Ok(stream)
    }

    async fn next_sequence(
        &self,
        tenant_id: TenantId,
        scope: &str,
    ) -> Result<u64, EventStoreError> {
        let mut inner = self.lock()?;
        let counter = inner
            .counters
            .entry((tenant_id, scope.to_string()))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[async_trait]
impl OutboxStore for InMemoryEventStore {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>, EventStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .outbox
            .iter()
            .filter(|entry| entry.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        let mut inner = self.lock()?;
        let entry = Self::entry_mut(&mut inner, event_id)?;
        entry.published_at = Some(Utc::now());
        Ok(())
    }

    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<u32, EventStoreError> {
        let mut inner = self.lock()?;
        let entry = Self::entry_mut(&mut inner, event_id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        Ok(entry.attempts)
    }

    async fn mark_dead_lettered(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        let mut inner = self.lock()?;
        let entry = Self::entry_mut(&mut inner, event_id)?;
        entry.dead_lettered = true;
        Ok(())
    }

    async fn fetch_dead_lettered(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, EventStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .outbox
            .iter()
            .filter(|entry| entry.dead_lettered)
            .take(limit)
            .cloned()
            .collect())
    }
}
