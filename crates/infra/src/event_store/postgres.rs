//! Postgres event store with transactional outbox.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE events (
//!     event_id        UUID PRIMARY KEY,
//!     tenant_id       UUID NOT NULL,
//!     aggregate_id    UUID NOT NULL,
//!     aggregate_type  TEXT NOT NULL,
//!     sequence_number BIGINT NOT NULL,
//!     event_type      TEXT NOT NULL,
//!     schema_version  INT NOT NULL,
//!     occurred_at     TIMESTAMPTZ NOT NULL,
//!     correlation_id  UUID NOT NULL,
//!     causation_id    UUID,
//!     payload         JSONB NOT NULL,
//!     UNIQUE (tenant_id, aggregate_id, sequence_number)
//! );
//!
//! CREATE TABLE event_outbox (
//!     event_id      UUID PRIMARY KEY REFERENCES events (event_id),
//!     position      BIGSERIAL UNIQUE,
//!     tenant_id     UUID NOT NULL,
//!     aggregate_id  UUID NOT NULL,
//!     event_type    TEXT NOT NULL,
//!     payload       JSONB NOT NULL,
//!     created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     attempts      INT NOT NULL DEFAULT 0,
//!     last_error    TEXT,
//!     published_at  TIMESTAMPTZ,
//!     dead_lettered BOOLEAN NOT NULL DEFAULT FALSE
//! );
//!
//! CREATE INDEX event_outbox_pending
//!     ON event_outbox (position)
//!     WHERE published_at IS NULL AND NOT dead_lettered;
//!
//! CREATE TABLE document_counters (
//!     tenant_id UUID NOT NULL,
//!     scope     TEXT NOT NULL,
//!     value     BIGINT NOT NULL,
//!     PRIMARY KEY (tenant_id, scope)
//! );
//! ```
//!
//! Events and their outbox rows commit in one transaction. The unique
//! constraint on `(tenant_id, aggregate_id, sequence_number)` backs the
//! optimistic concurrency check: two writers that both loaded version N can
//! both pass the version probe, but only one insert of N+1 survives, the
//! other maps to [`EventStoreError::Concurrency`] via error code 23505.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use fakturo_core::{AggregateId, ExpectedVersion, TenantId};

use crate::outbox::{OutboxEntry, OutboxStore};

use super::record::{
    EventStoreError, StoredEvent, UncommittedEvent, validate_batch, validate_stream,
};
use super::store::EventStore;

/// Event store + outbox backed by Postgres.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> EventStoreError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            EventStoreError::Concurrency(format!("{operation}: unique constraint violated: {db}"))
        }
        sqlx::Error::Database(db) => EventStoreError::Storage(format!("{operation}: {db}")),
        other => EventStoreError::Storage(format!("{operation}: {other}")),
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            tenant_id = tracing::field::Empty,
            aggregate_id = tracing::field::Empty,
            batch = events.len(),
        ),
        err
    )]
    async fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let (tenant_id, aggregate_id, aggregate_type) = validate_batch(&events)?;
        let aggregate_type = aggregate_type.to_string();

        let span = Span::current();
        span.record("tenant_id", tracing::field::display(&tenant_id));
        span.record("aggregate_id", tracing::field::display(&aggregate_id));

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin append", e))?;

        let probe = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_number), 0) AS current_version,
                   MIN(aggregate_type) AS aggregate_type
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("probe stream version", e))?;

        let current_version: i64 = probe
            .try_get("current_version")
            .map_err(|e| map_sqlx_error("read stream version", e))?;
        let stored_type: Option<String> = probe
            .try_get("aggregate_type")
            .map_err(|e| map_sqlx_error("read aggregate type", e))?;

        if let Some(stored_type) = stored_type
            && stored_type != aggregate_type
        {
            return Err(EventStoreError::AggregateTypeMismatch(format!(
                "stream {aggregate_id} holds {stored_type} events, append carries {aggregate_type}"
            )));
        }

        let current_version = current_version as u64;
        if !expected_version.matches(current_version) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, stream {aggregate_id} is at {current_version}"
            )));
        }

        let mut committed = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let stored = StoredEvent::from_uncommitted(event, current_version + offset as u64 + 1);

            sqlx::query(
                r#"
                INSERT INTO events (
                    event_id, tenant_id, aggregate_id, aggregate_type,
                    sequence_number, event_type, schema_version, occurred_at,
                    correlation_id, causation_id, payload
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(stored.event_id)
            .bind(stored.tenant_id.as_uuid())
            .bind(stored.aggregate_id.as_uuid())
            .bind(&stored.aggregate_type)
            .bind(stored.sequence_number as i64)
            .bind(&stored.event_type)
            .bind(stored.schema_version as i32)
            .bind(stored.occurred_at)
            .bind(stored.correlation_id)
            .bind(stored.causation_id)
            .bind(&stored.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert event", e))?;

            let envelope = serde_json::to_value(stored.to_envelope())
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO event_outbox (event_id, tenant_id, aggregate_id, event_type, payload)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(stored.event_id)
            .bind(stored.tenant_id.as_uuid())
            .bind(stored.aggregate_id.as_uuid())
            .bind(&stored.event_type)
            .bind(&envelope)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert outbox entry", e))?;

            committed.push(stored);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit append", e))?;

        Ok(committed)
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, aggregate_id = %aggregate_id),
        err
    )]
    async fn load_stream(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query_as::<_, StoredEventRow>(
            r#"
            SELECT event_id, tenant_id, aggregate_id, aggregate_type,
                   sequence_number, event_type, schema_version, occurred_at,
                   correlation_id, causation_id, payload
            FROM events
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load stream", e))?;

        let stream: Vec<StoredEvent> = rows.into_iter().map(StoredEvent::from).collect();
        validate_stream(tenant_id, aggregate_id, &stream)?;
        Ok(stream)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, scope = scope), err)]
    async fn next_sequence(
        &self,
        tenant_id: TenantId,
        scope: &str,
    ) -> Result<u64, EventStoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO document_counters (tenant_id, scope, value)
            VALUES ($1, $2, 1)
            ON CONFLICT (tenant_id, scope)
            DO UPDATE SET value = document_counters.value + 1
            RETURNING value
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(scope)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("allocate counter value", e))?;

        let value: i64 = row
            .try_get("value")
            .map_err(|e| map_sqlx_error("read counter value", e))?;
        Ok(value as u64)
    }
}

#[async_trait]
impl OutboxStore for PostgresEventStore {
    #[instrument(skip(self), err)]
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>, EventStoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT position, tenant_id, aggregate_id, event_id, event_type,
                   payload, created_at, attempts, last_error, published_at,
                   dead_lettered
            FROM event_outbox
            WHERE published_at IS NULL AND NOT dead_lettered
            ORDER BY position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch unpublished", e))?;

        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn mark_published(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        let result = sqlx::query(
            r#"UPDATE event_outbox SET published_at = NOW() WHERE event_id = $1"#,
        )
        .bind(event_id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark published", e))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::Storage(format!(
                "unknown outbox entry {event_id}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn record_failure(&self, event_id: Uuid, error: &str) -> Result<u32, EventStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE event_outbox
            SET attempts = attempts + 1, last_error = $2
            WHERE event_id = $1
            RETURNING attempts
            "#,
        )
        .bind(event_id)
        .bind(error)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record publish failure", e))?;

        let attempts: i32 = row
            .try_get("attempts")
            .map_err(|e| map_sqlx_error("read attempt count", e))?;
        Ok(attempts as u32)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn mark_dead_lettered(&self, event_id: Uuid) -> Result<(), EventStoreError> {
        let result =
            sqlx::query(r#"UPDATE event_outbox SET dead_lettered = TRUE WHERE event_id = $1"#)
                .bind(event_id)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("mark dead-lettered", e))?;

        if result.rows_affected() == 0 {
            return Err(EventStoreError::Storage(format!(
                "unknown outbox entry {event_id}"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn fetch_dead_lettered(
        &self,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, EventStoreError> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT position, tenant_id, aggregate_id, event_id, event_type,
                   payload, created_at, attempts, last_error, published_at,
                   dead_lettered
            FROM event_outbox
            WHERE dead_lettered
            ORDER BY position ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch dead-lettered", e))?;

        Ok(rows.into_iter().map(OutboxEntry::from).collect())
    }
}

struct StoredEventRow {
    event_id: Uuid,
    tenant_id: Uuid,
    aggregate_id: Uuid,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    schema_version: i32,
    occurred_at: DateTime<Utc>,
    correlation_id: Uuid,
    causation_id: Option<Uuid>,
    payload: JsonValue,
}

impl FromRow<'_, PgRow> for StoredEventRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            sequence_number: row.try_get("sequence_number")?,
            event_type: row.try_get("event_type")?,
            schema_version: row.try_get("schema_version")?,
            occurred_at: row.try_get("occurred_at")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl From<StoredEventRow> for StoredEvent {
    fn from(row: StoredEventRow) -> Self {
        Self {
            event_id: row.event_id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number as u64,
            event_type: row.event_type,
            schema_version: row.schema_version as u32,
            occurred_at: row.occurred_at,
            correlation_id: row.correlation_id,
            causation_id: row.causation_id,
            payload: row.payload,
        }
    }
}

struct OutboxRow {
    position: i64,
    tenant_id: Uuid,
    aggregate_id: Uuid,
    event_id: Uuid,
    event_type: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
    attempts: i32,
    last_error: Option<String>,
    published_at: Option<DateTime<Utc>>,
    dead_lettered: bool,
}

impl FromRow<'_, PgRow> for OutboxRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            position: row.try_get("position")?,
            tenant_id: row.try_get("tenant_id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_id: row.try_get("event_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            published_at: row.try_get("published_at")?,
            dead_lettered: row.try_get("dead_lettered")?,
        })
    }
}

impl From<OutboxRow> for OutboxEntry {
    fn from(row: OutboxRow) -> Self {
        Self {
            position: row.position as u64,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            aggregate_id: AggregateId::from_uuid(row.aggregate_id),
            event_id: row.event_id,
            event_type: row.event_type,
            payload: row.payload,
            created_at: row.created_at,
            attempts: row.attempts as u32,
            last_error: row.last_error,
            published_at: row.published_at,
            dead_lettered: row.dead_lettered,
        }
    }
}
