//! Command side: dispatcher, idempotency bookkeeping and the invoice
//! application service.

pub mod dispatcher;
pub mod idempotency;
pub mod service;

pub use dispatcher::{
    CommandDispatcher, DispatchContext, DispatchError, DispatchOutcome, DispatcherConfig,
    rehydrate,
};
pub use idempotency::{
    CommandOutcome, CommandReceipt, IdempotencyConfig, IdempotencyStore,
    InMemoryIdempotencyStore, PostgresIdempotencyStore, Reservation,
};
pub use service::{CommandContext, INVOICE_AGGREGATE_TYPE, InvoiceCommandService};
