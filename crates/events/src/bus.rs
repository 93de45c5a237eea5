//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **distribution** layer for events after they have been
//! durably appended; it is never storage. Events reach it through the outbox,
//! so a lost bus message is always recoverable by redelivery.
//!
//! Delivery contract:
//! - **At-least-once**: a message may arrive more than once; consumers must
//!   be idempotent.
//! - **Broadcast**: every subscriber receives its own copy of each message.
//! - Ordering between concurrent publishers is whatever the implementation
//!   provides; the outbox serializes per-aggregate order before publishing.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Designed for single-threaded consumption; one subscription per consumer
/// loop. The poll pattern:
///
/// ```ignore
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(message) => process(message)?,
///         Err(RecvTimeoutError::Timeout) => continue,      // check shutdown
///         Err(RecvTimeoutError::Disconnected) => break,    // bus closed
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// Sits between the outbox and event consumers:
///
/// ```text
/// Event Store (append) → Outbox (drain) → Event Bus (publish) → Consumers
///                                                                  ├─ Projections
///                                                                  └─ Workers
/// ```
///
/// `publish()` may fail (bus full, transport error). Callers retry: events
/// are already persisted, so republishing is always safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
