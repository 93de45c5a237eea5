//! `fakturo-events` — event primitives shared by domain and infrastructure.
//!
//! The [`Event`] trait describes a domain fact; [`EventEnvelope`] wraps it
//! with the tenant/stream/tracing metadata that travels with it from the
//! event store through the outbox onto the bus.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::{EventEnvelope, EventMetadata};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use tenant::TenantScoped;
