//! Event storage.
//!
//! Streams are the write model's source of truth; every append also enlists
//! its events in the transactional outbox. Two backends share one contract:
//! [`InMemoryEventStore`] for tests and single-process runs,
//! [`PostgresEventStore`] for production.

pub mod in_memory;
pub mod postgres;
pub mod record;
pub mod store;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use record::{EventStoreError, StoredEvent, UncommittedEvent};
pub use store::EventStore;
