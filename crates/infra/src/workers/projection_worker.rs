//! Background worker that feeds bus messages to a projection handler.
//!
//! The relay publishes envelopes to the bus; this worker drains one
//! subscription on a dedicated thread and hands each message to a handler
//! (typically `InvoicesProjection::apply_envelope`). Delivery is
//! at-least-once, so the handler must tolerate duplicates; handler errors
//! are logged and the worker keeps going, because a poisoned message must
//! not starve the rest of the feed.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use fakturo_core::TenantId;
use fakturo_events::{EventBus, Subscription, TenantScoped};

/// Handle to stop and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Ask the worker to stop and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a named worker thread over a fresh bus subscription.
    ///
    /// When `tenant_id` is set, messages for other tenants are dropped
    /// before the handler sees them.
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        tenant_id: Option<TenantId>,
        mut handler: H,
    ) -> WorkerHandle
    where
        M: TenantScoped + Send + 'static,
        B: EventBus<M> + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let subscription: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, subscription, shutdown_rx, tenant_id, &mut handler))
            .expect("failed to spawn projection worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    subscription: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    tenant_id: Option<TenantId>,
    handler: &mut H,
) where
    M: TenantScoped,
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(tick) {
            Ok(message) => {
                if let Some(only) = tenant_id
                    && message.tenant_id() != only
                {
                    continue;
                }
                if let Err(err) = handler(message) {
                    warn!(worker = name, error = ?err, "projection handler failed");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
