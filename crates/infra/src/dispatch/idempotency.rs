//! Idempotent command execution.
//!
//! Every command carries a client-chosen idempotency key, scoped per tenant.
//! The store tracks each key through reserve → complete/release:
//!
//! - a fresh key is claimed atomically and executed;
//! - a key whose command finished replays the recorded outcome, success and
//!   business rejection alike, without re-executing anything;
//! - a key still in flight is reported as a retryable conflict;
//! - transient failures release the key so the caller's retry can run.
//!
//! Recorded outcomes expire after a retention window; a key reused beyond it
//! executes as new.
//!
//! ## Postgres schema
//!
//! ```sql
//! CREATE TABLE idempotency_keys (
//!     tenant_id       UUID NOT NULL,
//!     idempotency_key TEXT NOT NULL,
//!     state           TEXT NOT NULL,        -- 'in_flight' | 'completed'
//!     outcome         JSONB,
//!     recorded_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (tenant_id, idempotency_key)
//! );
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use fakturo_core::TenantId;
use fakturo_invoicing::InvoiceId;

use crate::event_store::EventStoreError;

/// What a completed command handed back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReceipt {
    pub invoice_id: InvoiceId,
    /// Stream version after the command's events were appended.
    pub version: u64,
}

/// Recorded outcome of a finished command.
///
/// Business rejections are recorded too: replaying a rejected command must
/// yield the same rejection, not a second execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Completed(CommandReceipt),
    Rejected { code: String, message: String },
}

/// Result of reserving an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The key is new; the caller owns it and must complete or release it.
    Fresh,
    /// The key finished earlier within the retention window.
    Completed(CommandOutcome),
    /// Another request holding this key has not finished.
    InFlight,
}

/// Retention window for recorded outcomes.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub retention: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-tenant idempotency key bookkeeping.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claim a key, or report what already happened to it.
    async fn reserve(&self, tenant_id: TenantId, key: &str)
    -> Result<Reservation, EventStoreError>;

    /// Record the outcome for a key this caller reserved.
    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &str,
        outcome: CommandOutcome,
    ) -> Result<(), EventStoreError>;

    /// Free a reserved key after a transient failure so a retry can run.
    async fn release(&self, tenant_id: TenantId, key: &str) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> IdempotencyStore for Arc<S>
where
    S: IdempotencyStore + ?Sized,
{
    async fn reserve(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Reservation, EventStoreError> {
        (**self).reserve(tenant_id, key).await
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &str,
        outcome: CommandOutcome,
    ) -> Result<(), EventStoreError> {
        (**self).complete(tenant_id, key, outcome).await
    }

    async fn release(&self, tenant_id: TenantId, key: &str) -> Result<(), EventStoreError> {
        (**self).release(tenant_id, key).await
    }
}

#[derive(Debug, Clone)]
enum KeyState {
    InFlight,
    Done(CommandOutcome),
}

#[derive(Debug, Clone)]
struct KeyEntry {
    state: KeyState,
    recorded_at: DateTime<Utc>,
}

/// In-memory [`IdempotencyStore`] for tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<(TenantId, String), KeyEntry>>,
    config: IdempotencyConfig,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: IdempotencyConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn lock(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<(TenantId, String), KeyEntry>>, EventStoreError> {
        self.entries
            .lock()
            .map_err(|_| EventStoreError::Storage("idempotency store lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Reservation, EventStoreError> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| EventStoreError::Storage(format!("retention out of range: {e}")))?;

        let mut entries = self.lock()?;
        let entry_key = (tenant_id, key.to_string());

        if let Some(entry) = entries.get(&entry_key)
            && now - entry.recorded_at >= retention
        {
            entries.remove(&entry_key);
        }

        match entries.get(&entry_key) {
            None => {
                entries.insert(
                    entry_key,
                    KeyEntry {
                        state: KeyState::InFlight,
                        recorded_at: now,
                    },
                );
                Ok(Reservation::Fresh)
            }
            Some(entry) => match &entry.state {
                KeyState::InFlight => Ok(Reservation::InFlight),
                KeyState::Done(outcome) => Ok(Reservation::Completed(outcome.clone())),
            },
        }
    }

    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &str,
        outcome: CommandOutcome,
    ) -> Result<(), EventStoreError> {
        let mut entries = self.lock()?;
        entries.insert(
            (tenant_id, key.to_string()),
            KeyEntry {
                state: KeyState::Done(outcome),
                recorded_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn release(&self, tenant_id: TenantId, key: &str) -> Result<(), EventStoreError> {
        let mut entries = self.lock()?;
        let entry_key = (tenant_id, key.to_string());
        if let Some(entry) = entries.get(&entry_key)
            && matches!(entry.state, KeyState::InFlight)
        {
            entries.remove(&entry_key);
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> EventStoreError {
    EventStoreError::Storage(format!("{operation}: {e}"))
}

/// Postgres-backed [`IdempotencyStore`].
///
/// Reservation rides on the primary key: `INSERT .. ON CONFLICT DO NOTHING`
/// claims the key for exactly one writer; everyone else reads what the
/// winner left behind. Expired keys are purged lazily on reservation.
#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
    config: IdempotencyConfig,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, IdempotencyConfig::default())
    }

    pub fn with_config(pool: PgPool, config: IdempotencyConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn reserve(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Reservation, EventStoreError> {
        let retention_secs = self.config.retention.as_secs() as i64;
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE tenant_id = $1
              AND idempotency_key = $2
              AND recorded_at < NOW() - ($3 * INTERVAL '1 second')
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .bind(retention_secs)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge expired key", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (tenant_id, idempotency_key, state)
            VALUES ($1, $2, 'in_flight')
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reserve key", e))?;

        if inserted.rows_affected() == 1 {
            return Ok(Reservation::Fresh);
        }

        let row = sqlx::query(
            r#"
            SELECT state, outcome FROM idempotency_keys
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read key state", e))?;

        // The key can vanish between insert and select if a concurrent
        // release landed; report in-flight and let the caller retry.
        let Some(row) = row else {
            return Ok(Reservation::InFlight);
        };

        let state: String = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("read key state", e))?;
        if state != "completed" {
            return Ok(Reservation::InFlight);
        }

        let outcome: JsonValue = row
            .try_get("outcome")
            .map_err(|e| map_sqlx_error("read key outcome", e))?;
        let outcome: CommandOutcome = serde_json::from_value(outcome)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
        Ok(Reservation::Completed(outcome))
    }

    #[instrument(skip(self, outcome), fields(tenant_id = %tenant_id), err)]
    async fn complete(
        &self,
        tenant_id: TenantId,
        key: &str,
        outcome: CommandOutcome,
    ) -> Result<(), EventStoreError> {
        let payload = serde_json::to_value(&outcome)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            UPDATE idempotency_keys
            SET state = 'completed', outcome = $3, recorded_at = NOW()
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .bind(&payload)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record outcome", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn release(&self, tenant_id: TenantId, key: &str) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE tenant_id = $1 AND idempotency_key = $2 AND state = 'in_flight'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release key", e))?;
        Ok(())
    }
}
