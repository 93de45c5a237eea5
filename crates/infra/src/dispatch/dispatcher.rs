//! Command dispatch pipeline.
//!
//! One dispatch runs load → rehydrate → handle → append:
//!
//! 1. Load the aggregate's stream and note its version.
//! 2. Rebuild the aggregate by folding the history through `apply`.
//! 3. Ask the aggregate to handle the command; rejections surface as typed
//!    errors and leave the stream untouched.
//! 4. Append the decided events with `ExpectedVersion::Exact(loaded)`.
//!
//! A concurrency conflict on step 4 means another writer got there first;
//! the whole cycle is retried against fresh state, a bounded number of times
//! with backoff. A caller-supplied deadline is checked between phases, so a
//! slow store turns into a clean `DeadlineExceeded` instead of an unbounded
//! stall.

use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use fakturo_core::{Aggregate, AggregateId, DomainError, ExpectedVersion, TenantId};
use fakturo_events::Event;

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
use crate::retry::RetryPolicy;

/// Failures surfaced by command dispatch.
///
/// Domain rejections and infrastructure failures share one enum so callers
/// get a single taxonomy with stable codes; [`DispatchError::is_transient`]
/// separates what is worth retrying.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Command input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A business rule rejected the command.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The command conflicts with the aggregate's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The target aggregate does not exist.
    #[error("not found")]
    NotFound,

    /// The actor may not execute this command.
    #[error("unauthorized")]
    Unauthorized,

    /// Another writer modified the stream; retrying may succeed.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// The command crossed a tenant boundary.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// A stored event could not be decoded during rehydration.
    #[error("failed to decode stored event: {0}")]
    Deserialize(String),

    /// The event store failed.
    #[error(transparent)]
    Store(EventStoreError),

    /// The caller-supplied deadline passed before the command committed.
    #[error("command deadline exceeded")]
    DeadlineExceeded,

    /// A command with the same idempotency key has not finished yet.
    #[error("a command with this idempotency key is still in flight")]
    IdempotencyInFlight,
}

impl DispatchError {
    /// Stable machine-readable code. API layers match on these, never on
    /// messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::InvariantViolation(_) => "business_rule_violated",
            Self::Conflict(_) => "conflict",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Concurrency(_) => "concurrency_conflict",
            Self::TenantIsolation(_) => "tenant_isolation",
            Self::Deserialize(_) => "event_decode_failed",
            Self::Store(_) => "storage_failure",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::IdempotencyInFlight => "idempotency_in_flight",
        }
    }

    /// Whether retrying the same command may succeed.
    ///
    /// `DeadlineExceeded` counts as transient: the effect of the timed-out
    /// attempt is unknown, and a retry under the same idempotency key
    /// resolves it safely either way.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Concurrency(_) | Self::DeadlineExceeded | Self::IdempotencyInFlight => true,
            Self::Store(e) => matches!(e, EventStoreError::Storage(_)),
            _ => false,
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => Self::Validation(msg),
            DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::InvariantViolation(msg) => Self::InvariantViolation(msg),
            DomainError::NotFound => Self::NotFound,
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::Unauthorized => Self::Unauthorized,
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Concurrency(msg) => Self::Concurrency(msg),
            EventStoreError::TenantIsolation(msg) => Self::TenantIsolation(msg),
            other => Self::Store(other),
        }
    }
}

/// Per-dispatch metadata threaded through to the stored events.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    /// Stamped on every event this dispatch appends.
    pub correlation_id: Uuid,
    /// Id of the message that caused this command, if any.
    pub causation_id: Option<Uuid>,
    /// Absolute point in time after which the dispatcher gives up.
    pub deadline: Option<Instant>,
}

impl DispatchContext {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            causation_id: None,
            deadline: None,
        }
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Retry schedule for optimistic concurrency conflicts.
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(25),
                Duration::from_millis(500),
            ),
        }
    }
}

/// Result of a successfully dispatched command.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Events appended by this dispatch, in append order.
    pub events: Vec<StoredEvent>,
    /// Stream version after the append.
    pub version: u64,
}

/// Executes commands against event-sourced aggregates.
pub struct CommandDispatcher<S> {
    store: S,
    config: DispatcherConfig,
}

impl<S> CommandDispatcher<S>
where
    S: EventStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            config: DispatcherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Dispatch a command against one aggregate instance.
    ///
    /// `make_aggregate` builds the empty aggregate to rehydrate into; it is
    /// called once per attempt because retries must start from fresh state.
    #[instrument(
        skip(self, command, context, make_aggregate),
        fields(
            tenant_id = %tenant_id,
            aggregate_id = %aggregate_id,
            aggregate_type = aggregate_type,
            correlation_id = %context.correlation_id,
        ),
        err
    )]
    pub async fn dispatch<A, F>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        context: &DispatchContext,
        make_aggregate: F,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: Event + Serialize + DeserializeOwned,
        F: Fn(TenantId, AggregateId) -> A,
    {
        let mut attempt = 1u32;
        loop {
            let result = self
                .try_dispatch(
                    tenant_id,
                    aggregate_id,
                    aggregate_type,
                    &command,
                    context,
                    &make_aggregate,
                )
                .await;

            match result {
                Err(DispatchError::Concurrency(conflict))
                    if self.config.retry.should_retry(attempt) =>
                {
                    let delay = self.config.retry.delay_for_attempt(attempt);
                    if would_exceed_deadline(context.deadline, delay) {
                        return Err(DispatchError::DeadlineExceeded);
                    }
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        conflict,
                        "concurrency conflict, retrying command"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn try_dispatch<A, F>(
        &self,
        tenant_id: TenantId,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: &A::Command,
        context: &DispatchContext,
        make_aggregate: &F,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: Event + Serialize + DeserializeOwned,
        F: Fn(TenantId, AggregateId) -> A,
    {
        check_deadline(context.deadline)?;

        let history = self.store.load_stream(tenant_id, aggregate_id).await?;
        let loaded_version = history.last().map(|e| e.sequence_number).unwrap_or(0);

        let mut aggregate = make_aggregate(tenant_id, aggregate_id);
        rehydrate(&mut aggregate, &history)?;

        check_deadline(context.deadline)?;

        let decided = aggregate.handle(command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            return Ok(DispatchOutcome {
                events: Vec::new(),
                version: loaded_version,
            });
        }

        let mut batch = Vec::with_capacity(decided.len());
        for event in &decided {
            batch.push(UncommittedEvent::from_typed(
                tenant_id,
                aggregate_id,
                aggregate_type,
                event,
                context.correlation_id,
                context.causation_id,
            )?);
        }

        check_deadline(context.deadline)?;

        let committed = self
            .store
            .append(batch, ExpectedVersion::Exact(loaded_version))
            .await?;
        let version = committed
            .last()
            .map(|e| e.sequence_number)
            .unwrap_or(loaded_version);

        debug!(events = committed.len(), version, "command dispatched");
        Ok(DispatchOutcome {
            events: committed,
            version,
        })
    }
}

/// Rebuild an aggregate from its stored history.
///
/// The store has already validated stream contiguity and ownership; here
/// each payload is decoded and folded through `apply`, which never fails on
/// history that was valid when appended.
pub fn rehydrate<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let event: A::Event = serde_json::from_value(stored.payload.clone()).map_err(|e| {
            DispatchError::Deserialize(format!(
                "event {} ({}): {e}",
                stored.event_id, stored.event_type
            ))
        })?;
        aggregate.apply(&event);
    }
    Ok(())
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), DispatchError> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(DispatchError::DeadlineExceeded),
        _ => Ok(()),
    }
}

fn would_exceed_deadline(deadline: Option<Instant>, delay: Duration) -> bool {
    deadline.is_some_and(|deadline| Instant::now() + delay >= deadline)
}
