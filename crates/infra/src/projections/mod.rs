//! Projections fold published event envelopes into queryable read models.

pub mod invoices;

pub use invoices::{InvoiceProjectionError, InvoiceReadModel, InvoicesProjection};
