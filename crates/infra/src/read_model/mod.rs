//! Read-model storage: a tenant-scoped key/value contract with in-memory
//! and Postgres implementations.

pub mod postgres;
pub mod tenant_store;

pub use postgres::PostgresInvoiceStore;
pub use tenant_store::{InMemoryTenantStore, TenantStore};
