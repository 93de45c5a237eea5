//! Transactional outbox: reliable event publication.
//!
//! Appends record a publication obligation next to the events themselves;
//! the [`OutboxRelay`] later moves those entries onto the bus. Crashing
//! anywhere in between never loses an event, only delays it.

pub mod publisher;
pub mod relay;
pub mod store;

pub use publisher::{BusEventPublisher, EventPublisher, PublishError};
pub use relay::{DrainReport, OutboxRelay, RelayConfig, RelayError, RelayHandle};
pub use store::{OutboxEntry, OutboxStore};
