//! Infrastructure for the invoicing domain.
//!
//! The write path runs command dispatch over an event store whose appends
//! also enlist a transactional outbox; a relay moves committed events onto
//! the bus, and projections fold them into read models served by the query
//! side. In-memory and Postgres backends implement the same contracts.

pub mod dispatch;
pub mod event_store;
pub mod outbox;
pub mod projections;
pub mod query;
pub mod read_model;
pub mod retry;
pub mod workers;

mod integration_tests;
