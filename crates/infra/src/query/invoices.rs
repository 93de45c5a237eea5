//! Query side for invoice read models.
//!
//! Queries never touch the event store: they read whatever the projection
//! has written, which trails the streams by however far the relay is
//! behind. Results are deterministic for a given read-model state.

use thiserror::Error;

use chrono::NaiveDate;

use fakturo_core::TenantId;
use fakturo_invoicing::{FiscalPeriod, InvoiceId, InvoiceStatus};

use crate::projections::InvoiceReadModel;
use crate::read_model::TenantStore;

/// Hard ceiling on page size, whatever the caller asks for.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Conjunctive listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvoiceFilter {
    pub status: Option<InvoiceStatus>,
    pub fiscal_period: Option<FiscalPeriod>,
    pub issued_from: Option<NaiveDate>,
    pub issued_to: Option<NaiveDate>,
}

impl InvoiceFilter {
    pub fn matches(&self, row: &InvoiceReadModel) -> bool {
        if let Some(status) = self.status
            && row.status != status
        {
            return false;
        }
        if let Some(period) = self.fiscal_period
            && row.fiscal_period != period
        {
            return false;
        }
        if let Some(from) = self.issued_from
            && row.issue_date < from
        {
            return false;
        }
        if let Some(to) = self.issued_to
            && row.issue_date > to
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

impl Pagination {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Requested limit clamped to [`MAX_PAGE_SIZE`].
    pub fn effective_limit(&self) -> u32 {
        self.limit.min(MAX_PAGE_SIZE)
    }
}

/// One page of results plus the total match count before paging.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("not found")]
    NotFound,
    #[error("read store failure: {0}")]
    Storage(String),
}

/// Read-side entry point over a [`TenantStore`] of invoice rows.
pub struct InvoiceQueries<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    store: S,
}

impl<S> InvoiceQueries<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: &InvoiceId,
    ) -> Result<InvoiceReadModel, QueryError> {
        self.store
            .get(tenant_id, invoice_id)
            .ok_or(QueryError::NotFound)
    }

    /// List the tenant's invoices matching `filter`, ordered by issue date
    /// (ties broken by invoice id) for stable paging.
    pub fn list_invoices(
        &self,
        tenant_id: TenantId,
        filter: &InvoiceFilter,
        page: Pagination,
    ) -> Page<InvoiceReadModel> {
        let mut rows: Vec<_> = self
            .store
            .list(tenant_id)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect();
        rows.sort_by_key(|row| (row.issue_date, *row.invoice_id.0.as_uuid().as_bytes()));

        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset as usize)
            .take(page.effective_limit() as usize)
            .collect();
        Page { items, total }
    }
}
