//! Query side: filtered, paginated reads over projected invoice rows.

pub mod invoices;

pub use invoices::{
    InvoiceFilter, InvoiceQueries, MAX_PAGE_SIZE, Page, Pagination, QueryError,
};
