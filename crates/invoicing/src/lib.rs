//! Invoicing domain: the `Invoice` aggregate and its value objects.
//!
//! Pure state machine over commands and events. Tax amounts come from
//! `fakturo-tax` at decision time and are recorded in events; replay only
//! re-applies recorded amounts.

pub mod invoice;
pub mod values;

pub use invoice::{
    AddLineItem, ApproveInvoice, CancelInvoice, CreateInvoice, Invoice, InvoiceApproved,
    InvoiceCancelled, InvoiceCommand, InvoiceCreated, InvoiceEvent, InvoiceId, InvoiceStatus,
    InvoiceTotalsRecalculated, LineItemAdded, LineItemRemoved, RemoveLineItem,
};
pub use values::{DocumentNumber, FiscalPeriod, LineItem, TaxIdentifier, Totals};
