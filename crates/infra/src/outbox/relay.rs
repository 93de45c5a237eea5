//! Outbox relay: drains pending entries onto the bus.
//!
//! The relay polls the outbox in position order and publishes each entry,
//! marking it published on success. Delivery is at-least-once: a crash
//! between publish and mark re-publishes the entry on the next pass, and
//! consumers deduplicate by event id.
//!
//! A failed publish halts the current batch instead of skipping ahead, so
//! later events of the same aggregate can never overtake an earlier one. The
//! failing head entry is retried with backoff and parked as dead-lettered
//! once its attempts are exhausted, unblocking the queue behind it.

use std::time::Duration;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fakturo_events::EventEnvelope;

use crate::event_store::EventStoreError;
use crate::retry::RetryPolicy;

use super::publisher::EventPublisher;
use super::store::{OutboxEntry, OutboxStore};

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Idle sleep between polls when the outbox is empty.
    pub poll_interval: Duration,
    /// Maximum entries fetched per drain pass.
    pub batch_size: usize,
    /// Publish retry schedule; `max_attempts` is the dead-letter bound.
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 32,
            retry: RetryPolicy::default(),
        }
    }
}

/// Failures of the relay's own storage operations.
///
/// Publish failures are not errors at this level; they are bookkept on the
/// entry and retried.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("outbox access failed: {0}")]
    Store(#[from] EventStoreError),
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Entries successfully published and marked in this pass.
    pub published: usize,
    /// Backoff requested by a failing head entry; `None` when the pass ended
    /// cleanly or the failing entry was dead-lettered.
    pub retry_after: Option<Duration>,
}

/// Moves committed events from the outbox to the bus.
pub struct OutboxRelay<S, P> {
    outbox: S,
    publisher: P,
    config: RelayConfig,
}

impl<S, P> OutboxRelay<S, P>
where
    S: OutboxStore,
    P: EventPublisher,
{
    pub fn new(outbox: S, publisher: P) -> Self {
        Self {
            outbox,
            publisher,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Drain one batch of pending entries.
    ///
    /// Stops at the first entry that fails to publish; everything before it
    /// is already marked published.
    pub async fn drain_once(&self) -> Result<DrainReport, RelayError> {
        let batch = self.outbox.fetch_unpublished(self.config.batch_size).await?;

        let mut published = 0usize;
        for entry in batch {
            let envelope: EventEnvelope<JsonValue> =
                match serde_json::from_value(entry.payload.clone()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        let retry_after = self
                            .handle_failure(&entry, &format!("undecodable outbox payload: {e}"))
                            .await?;
                        return Ok(DrainReport {
                            published,
                            retry_after,
                        });
                    }
                };

            match self.publisher.publish(envelope).await {
                Ok(()) => {
                    self.outbox.mark_published(entry.event_id).await?;
                    published += 1;
                    debug!(
                        event_id = %entry.event_id,
                        event_type = entry.event_type,
                        position = entry.position,
                        "outbox entry published"
                    );
                }
                Err(e) => {
                    let retry_after = self.handle_failure(&entry, &e.to_string()).await?;
                    return Ok(DrainReport {
                        published,
                        retry_after,
                    });
                }
            }
        }

        Ok(DrainReport {
            published,
            retry_after: None,
        })
    }

    /// Bookkeep a failed entry; returns the backoff to apply before the next
    /// pass, or `None` when the entry was dead-lettered.
    async fn handle_failure(
        &self,
        entry: &OutboxEntry,
        reason: &str,
    ) -> Result<Option<Duration>, RelayError> {
        let attempts = self.outbox.record_failure(entry.event_id, reason).await?;

        if self.config.retry.should_retry(attempts) {
            warn!(
                event_id = %entry.event_id,
                event_type = entry.event_type,
                attempts,
                error = reason,
                "outbox publish failed, will retry"
            );
            Ok(Some(self.config.retry.delay_for_attempt(attempts)))
        } else {
            error!(
                event_id = %entry.event_id,
                event_type = entry.event_type,
                attempts,
                error = reason,
                "outbox entry dead-lettered"
            );
            self.outbox.mark_dead_lettered(entry.event_id).await?;
            Ok(None)
        }
    }

    /// Run the relay on a background task until shut down.
    pub fn spawn(self, name: &'static str) -> RelayHandle
    where
        S: 'static,
        P: 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(relay_loop(self, name, shutdown_rx));

        RelayHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a spawned relay task.
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    /// Signal shutdown and wait for the relay task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(()).await;
        let _ = self.join.await;
    }
}

async fn relay_loop<S, P>(
    relay: OutboxRelay<S, P>,
    name: &'static str,
    mut shutdown: mpsc::Receiver<()>,
) where
    S: OutboxStore,
    P: EventPublisher,
{
    info!(relay = name, "outbox relay started");

    loop {
        let pause = match relay.drain_once().await {
            Ok(report) => {
                if let Some(backoff) = report.retry_after {
                    backoff
                } else if report.published == 0 {
                    relay.config.poll_interval
                } else {
                    Duration::ZERO
                }
            }
            Err(err) => {
                error!(relay = name, error = %err, "outbox drain failed");
                relay.config.poll_interval
            }
        };

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    info!(relay = name, "outbox relay stopped");
}
