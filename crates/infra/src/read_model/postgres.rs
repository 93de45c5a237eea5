//! Postgres-backed invoice read store.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE invoice_read_models (
//!     tenant_id           UUID NOT NULL,
//!     invoice_id          UUID NOT NULL,
//!     status              TEXT NOT NULL,
//!     currency            TEXT NOT NULL,
//!     issue_date          DATE NOT NULL,
//!     due_date            DATE NOT NULL,
//!     fiscal_period       TEXT NOT NULL,
//!     counterparty_tax_id TEXT,
//!     document_number     TEXT,
//!     lines               JSONB NOT NULL,
//!     subtotal            NUMERIC(20, 2) NOT NULL,
//!     tax                 NUMERIC(20, 2) NOT NULL,
//!     levies              NUMERIC(20, 2) NOT NULL,
//!     grand_total         NUMERIC(20, 2) NOT NULL,
//!     withholding         NUMERIC(20, 2) NOT NULL,
//!     amount_due          NUMERIC(20, 2) NOT NULL,
//!     cancelled_reason    TEXT,
//!     last_sequence       BIGINT NOT NULL,
//!     last_event_id       UUID NOT NULL,
//!     updated_at          TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (tenant_id, invoice_id)
//! );
//!
//! CREATE INDEX invoice_read_models_list
//!     ON invoice_read_models (tenant_id, issue_date, invoice_id);
//! ```
//!
//! The upsert is guarded by `last_sequence`: a projection worker that lags
//! behind another (rebuild racing live updates, or two workers after a
//! failover) can never roll a row back to older state.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use fakturo_core::{AggregateId, Currency, Money, TenantId};
use fakturo_invoicing::{
    DocumentNumber, FiscalPeriod, InvoiceId, InvoiceStatus, LineItem, TaxIdentifier,
};

use crate::projections::InvoiceReadModel;
use crate::query::{InvoiceFilter, Page, Pagination, QueryError};

/// Invoice rows in Postgres, written by the projection and read by queries.
#[derive(Debug, Clone)]
pub struct PostgresInvoiceStore {
    pool: Arc<PgPool>,
}

impl PostgresInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Write `row`, unless the stored row already reflects a newer event.
    #[instrument(skip(self, row), fields(
        tenant_id = %row.tenant_id,
        invoice_id = %row.invoice_id,
        last_sequence = row.last_sequence,
    ), err)]
    pub async fn upsert(&self, row: &InvoiceReadModel) -> Result<(), QueryError> {
        let lines = serde_json::to_value(&row.lines)
            .map_err(|e| QueryError::Storage(format!("encode lines: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO invoice_read_models (
                tenant_id, invoice_id, status, currency, issue_date, due_date,
                fiscal_period, counterparty_tax_id, document_number, lines,
                subtotal, tax, levies, grand_total, withholding, amount_due,
                cancelled_reason, last_sequence, last_event_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (tenant_id, invoice_id) DO UPDATE SET
                status = EXCLUDED.status,
                currency = EXCLUDED.currency,
                issue_date = EXCLUDED.issue_date,
                due_date = EXCLUDED.due_date,
                fiscal_period = EXCLUDED.fiscal_period,
                counterparty_tax_id = EXCLUDED.counterparty_tax_id,
                document_number = EXCLUDED.document_number,
                lines = EXCLUDED.lines,
                subtotal = EXCLUDED.subtotal,
                tax = EXCLUDED.tax,
                levies = EXCLUDED.levies,
                grand_total = EXCLUDED.grand_total,
                withholding = EXCLUDED.withholding,
                amount_due = EXCLUDED.amount_due,
                cancelled_reason = EXCLUDED.cancelled_reason,
                last_sequence = EXCLUDED.last_sequence,
                last_event_id = EXCLUDED.last_event_id,
                updated_at = EXCLUDED.updated_at
            WHERE invoice_read_models.last_sequence < EXCLUDED.last_sequence
            "#,
        )
        .bind(row.tenant_id.as_uuid())
        .bind(row.invoice_id.0.as_uuid())
        .bind(row.status.as_str())
        .bind(row.currency.to_string())
        .bind(row.issue_date)
        .bind(row.due_date)
        .bind(row.fiscal_period.to_string())
        .bind(row.counterparty_tax_id.as_ref().map(|t| t.as_str()))
        .bind(row.document_number.map(|d| d.to_string()))
        .bind(&lines)
        .bind(row.subtotal.amount())
        .bind(row.tax.amount())
        .bind(row.levies.amount())
        .bind(row.grand_total.amount())
        .bind(row.withholding.amount())
        .bind(row.amount_due.amount())
        .bind(row.cancelled_reason.as_deref())
        .bind(row.last_sequence as i64)
        .bind(row.last_event_id)
        .bind(row.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert invoice row", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, invoice_id = %invoice_id), err)]
    pub async fn get(
        &self,
        tenant_id: TenantId,
        invoice_id: InvoiceId,
    ) -> Result<Option<InvoiceReadModel>, QueryError> {
        let row: Option<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, invoice_id, status, currency, issue_date, due_date,
                   fiscal_period, counterparty_tax_id, document_number, lines,
                   subtotal, tax, levies, grand_total, withholding, amount_due,
                   cancelled_reason, last_sequence, last_event_id, updated_at
            FROM invoice_read_models
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(invoice_id.0.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get invoice row", e))?;

        row.map(InvoiceReadModel::try_from).transpose()
    }

    /// Filtered page plus the total match count, ordered by issue date then
    /// invoice id.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id), err)]
    pub async fn list(
        &self,
        tenant_id: TenantId,
        filter: &InvoiceFilter,
        page: Pagination,
    ) -> Result<Page<InvoiceReadModel>, QueryError> {
        let status = filter.status.map(|s| s.as_str());
        let period = filter.fiscal_period.map(|p| p.to_string());

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM invoice_read_models
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR fiscal_period = $3)
              AND ($4::date IS NULL OR issue_date >= $4)
              AND ($5::date IS NULL OR issue_date <= $5)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(status)
        .bind(period.as_deref())
        .bind(filter.issued_from)
        .bind(filter.issued_to)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count invoice rows", e))?;

        let rows: Vec<InvoiceRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, invoice_id, status, currency, issue_date, due_date,
                   fiscal_period, counterparty_tax_id, document_number, lines,
                   subtotal, tax, levies, grand_total, withholding, amount_due,
                   cancelled_reason, last_sequence, last_event_id, updated_at
            FROM invoice_read_models
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR fiscal_period = $3)
              AND ($4::date IS NULL OR issue_date >= $4)
              AND ($5::date IS NULL OR issue_date <= $5)
            ORDER BY issue_date, invoice_id
            LIMIT $6 OFFSET $7
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(status)
        .bind(period.as_deref())
        .bind(filter.issued_from)
        .bind(filter.issued_to)
        .bind(i64::from(page.effective_limit()))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list invoice rows", e))?;

        let items = rows
            .into_iter()
            .map(InvoiceReadModel::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
        })
    }

    /// Drop every row the tenant owns, ahead of a projection rebuild.
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn clear_tenant(&self, tenant_id: TenantId) -> Result<(), QueryError> {
        sqlx::query("DELETE FROM invoice_read_models WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear tenant rows", e))?;
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> QueryError {
    QueryError::Storage(format!("{operation}: {e}"))
}

struct InvoiceRow {
    tenant_id: Uuid,
    invoice_id: Uuid,
    status: String,
    currency: String,
    issue_date: NaiveDate,
    due_date: NaiveDate,
    fiscal_period: String,
    counterparty_tax_id: Option<String>,
    document_number: Option<String>,
    lines: JsonValue,
    subtotal: Decimal,
    tax: Decimal,
    levies: Decimal,
    grand_total: Decimal,
    withholding: Decimal,
    amount_due: Decimal,
    cancelled_reason: Option<String>,
    last_sequence: i64,
    last_event_id: Uuid,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for InvoiceRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            tenant_id: row.try_get("tenant_id")?,
            invoice_id: row.try_get("invoice_id")?,
            status: row.try_get("status")?,
            currency: row.try_get("currency")?,
            issue_date: row.try_get("issue_date")?,
            due_date: row.try_get("due_date")?,
            fiscal_period: row.try_get("fiscal_period")?,
            counterparty_tax_id: row.try_get("counterparty_tax_id")?,
            document_number: row.try_get("document_number")?,
            lines: row.try_get("lines")?,
            subtotal: row.try_get("subtotal")?,
            tax: row.try_get("tax")?,
            levies: row.try_get("levies")?,
            grand_total: row.try_get("grand_total")?,
            withholding: row.try_get("withholding")?,
            amount_due: row.try_get("amount_due")?,
            cancelled_reason: row.try_get("cancelled_reason")?,
            last_sequence: row.try_get("last_sequence")?,
            last_event_id: row.try_get("last_event_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<InvoiceRow> for InvoiceReadModel {
    type Error = QueryError;

    fn try_from(row: InvoiceRow) -> Result<Self, Self::Error> {
        let decode = |what: &str, e: String| QueryError::Storage(format!("decode {what}: {e}"));

        let status = match row.status.as_str() {
            "draft" => InvoiceStatus::Draft,
            "approved" => InvoiceStatus::Approved,
            "cancelled" => InvoiceStatus::Cancelled,
            other => {
                return Err(QueryError::Storage(format!(
                    "unknown invoice status {other:?}"
                )));
            }
        };
        let currency: Currency = row
            .currency
            .parse()
            .map_err(|e: fakturo_core::DomainError| decode("currency", e.to_string()))?;
        let fiscal_period = FiscalPeriod::parse(&row.fiscal_period)
            .map_err(|e| decode("fiscal period", e.to_string()))?;
        let counterparty_tax_id = row
            .counterparty_tax_id
            .map(|s| TaxIdentifier::new(&s))
            .transpose()
            .map_err(|e| decode("counterparty tax id", e.to_string()))?;
        let document_number = row
            .document_number
            .map(|s| DocumentNumber::parse(&s))
            .transpose()
            .map_err(|e| decode("document number", e.to_string()))?;
        let lines: Vec<LineItem> = serde_json::from_value(row.lines)
            .map_err(|e| decode("lines", e.to_string()))?;
        let money =
            |what: &str, amount| Money::new(amount, currency).map_err(|e| decode(what, e.to_string()));

        Ok(Self {
            invoice_id: InvoiceId::new(AggregateId::from_uuid(row.invoice_id)),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            status,
            currency,
            issue_date: row.issue_date,
            due_date: row.due_date,
            fiscal_period,
            counterparty_tax_id,
            document_number,
            lines,
            subtotal: money("subtotal", row.subtotal)?,
            tax: money("tax", row.tax)?,
            levies: money("levies", row.levies)?,
            grand_total: money("grand total", row.grand_total)?,
            withholding: money("withholding", row.withholding)?,
            amount_due: money("amount due", row.amount_due)?,
            cancelled_reason: row.cancelled_reason,
            last_sequence: row.last_sequence as u64,
            last_event_id: row.last_event_id,
            updated_at: row.updated_at,
        })
    }
}
