use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fakturo_core::{
    Aggregate, AggregateId, AggregateRoot, Currency, DomainError, Money, TenantId, UserId,
};
use fakturo_events::Event;
use fakturo_tax::{JurisdictionRules, LineInput, TaxCategory, compute_line, compute_withholding};

use crate::values::{DocumentNumber, FiscalPeriod, LineItem, TaxIdentifier, Totals};

/// Invoice identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvoiceId(pub AggregateId);

impl InvoiceId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Invoice status lifecycle: Draft -> Approved -> Cancelled, with Cancel also
/// allowed straight from Draft. Nothing re-enters Draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    Approved,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Approved => "approved",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root: Invoice.
///
/// Pure state-transition logic. The jurisdiction rate tables are loaded at
/// construction; `handle` consults them when pricing a new line, while
/// `apply` replays the amounts recorded in events and never recomputes.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    id: InvoiceId,
    rules: Arc<JurisdictionRules>,
    tenant_id: Option<TenantId>,
    status: InvoiceStatus,
    currency: Option<Currency>,
    issue_date: Option<NaiveDate>,
    due_date: Option<NaiveDate>,
    fiscal_period: Option<FiscalPeriod>,
    counterparty_tax_id: Option<TaxIdentifier>,
    lines: Vec<LineItem>,
    next_line_no: u32,
    document_number: Option<DocumentNumber>,
    totals: Option<Totals>,
    cancelled_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Invoice {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: InvoiceId, rules: Arc<JurisdictionRules>) -> Self {
        Self {
            id,
            rules,
            tenant_id: None,
            status: InvoiceStatus::Draft,
            currency: None,
            issue_date: None,
            due_date: None,
            fiscal_period: None,
            counterparty_tax_id: None,
            lines: Vec::new(),
            next_line_no: 1,
            document_number: None,
            totals: None,
            cancelled_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InvoiceId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn status(&self) -> InvoiceStatus {
        self.status
    }

    pub fn currency(&self) -> Option<Currency> {
        self.currency
    }

    pub fn issue_date(&self) -> Option<NaiveDate> {
        self.issue_date
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due_date
    }

    pub fn fiscal_period(&self) -> Option<FiscalPeriod> {
        self.fiscal_period
    }

    pub fn counterparty_tax_id(&self) -> Option<&TaxIdentifier> {
        self.counterparty_tax_id.as_ref()
    }

    pub fn lines(&self) -> &[LineItem] {
        &self.lines
    }

    pub fn document_number(&self) -> Option<DocumentNumber> {
        self.document_number
    }

    pub fn totals(&self) -> Option<&Totals> {
        self.totals.as_ref()
    }

    pub fn cancelled_reason(&self) -> Option<&str> {
        self.cancelled_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for Invoice {
    type Id = InvoiceId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateInvoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub currency: Currency,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub counterparty_tax_id: Option<TaxIdentifier>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AddLineItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddLineItem {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Money,
    pub tax_category: TaxCategory,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RemoveLineItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveLineItem {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveInvoice.
///
/// Carries the document number the command service allocated for
/// `(tenant, fiscal period)` right before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub approved_by: UserId,
    pub document_number: DocumentNumber,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelInvoice.
///
/// `settled` is established externally (payments live elsewhere) and arrives
/// here as an input flag only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelInvoice {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub cancelled_by: UserId,
    pub settled: bool,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceCommand {
    CreateInvoice(CreateInvoice),
    AddLineItem(AddLineItem),
    RemoveLineItem(RemoveLineItem),
    ApproveInvoice(ApproveInvoice),
    CancelInvoice(CancelInvoice),
}

/// Event: InvoiceCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub currency: Currency,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub fiscal_period: FiscalPeriod,
    pub counterparty_tax_id: Option<TaxIdentifier>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineItemAdded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemAdded {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub line: LineItem,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LineItemRemoved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemRemoved {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub line_no: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceTotalsRecalculated.
///
/// Emitted right after every line change; keeps the audit trail granular
/// (what changed vs. what it summed to).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceTotalsRecalculated {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub totals: Totals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceApproved {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub document_number: DocumentNumber,
    pub approved_by: UserId,
    /// Totals frozen at approval time.
    pub totals: Totals,
    pub occurred_at: DateTime<Utc>,
}

/// Event: InvoiceCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceCancelled {
    pub tenant_id: TenantId,
    pub invoice_id: InvoiceId,
    pub reason: String,
    pub cancelled_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceEvent {
    InvoiceCreated(InvoiceCreated),
    LineItemAdded(LineItemAdded),
    LineItemRemoved(LineItemRemoved),
    InvoiceTotalsRecalculated(InvoiceTotalsRecalculated),
    InvoiceApproved(InvoiceApproved),
    InvoiceCancelled(InvoiceCancelled),
}

impl InvoiceEvent {
    /// Tenant that owns the invoice this event belongs to.
    pub fn tenant_id(&self) -> TenantId {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.tenant_id,
            InvoiceEvent::LineItemAdded(e) => e.tenant_id,
            InvoiceEvent::LineItemRemoved(e) => e.tenant_id,
            InvoiceEvent::InvoiceTotalsRecalculated(e) => e.tenant_id,
            InvoiceEvent::InvoiceApproved(e) => e.tenant_id,
            InvoiceEvent::InvoiceCancelled(e) => e.tenant_id,
        }
    }

    /// Invoice the event belongs to.
    pub fn invoice_id(&self) -> InvoiceId {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.invoice_id,
            InvoiceEvent::LineItemAdded(e) => e.invoice_id,
            InvoiceEvent::LineItemRemoved(e) => e.invoice_id,
            InvoiceEvent::InvoiceTotalsRecalculated(e) => e.invoice_id,
            InvoiceEvent::InvoiceApproved(e) => e.invoice_id,
            InvoiceEvent::InvoiceCancelled(e) => e.invoice_id,
        }
    }
}

impl Event for InvoiceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InvoiceEvent::InvoiceCreated(_) => "invoicing.invoice.created",
            InvoiceEvent::LineItemAdded(_) => "invoicing.invoice.line_item_added",
            InvoiceEvent::LineItemRemoved(_) => "invoicing.invoice.line_item_removed",
            InvoiceEvent::InvoiceTotalsRecalculated(_) => "invoicing.invoice.totals_recalculated",
            InvoiceEvent::InvoiceApproved(_) => "invoicing.invoice.approved",
            InvoiceEvent::InvoiceCancelled(_) => "invoicing.invoice.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InvoiceEvent::InvoiceCreated(e) => e.occurred_at,
            InvoiceEvent::LineItemAdded(e) => e.occurred_at,
            InvoiceEvent::LineItemRemoved(e) => e.occurred_at,
            InvoiceEvent::InvoiceTotalsRecalculated(e) => e.occurred_at,
            InvoiceEvent::InvoiceApproved(e) => e.occurred_at,
            InvoiceEvent::InvoiceCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Invoice {
    type Command = InvoiceCommand;
    type Event = InvoiceEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InvoiceEvent::InvoiceCreated(e) => {
                self.id = e.invoice_id;
                self.tenant_id = Some(e.tenant_id);
                self.status = InvoiceStatus::Draft;
                self.currency = Some(e.currency);
                self.issue_date = Some(e.issue_date);
                self.due_date = Some(e.due_date);
                self.fiscal_period = Some(e.fiscal_period);
                self.counterparty_tax_id = e.counterparty_tax_id.clone();
                self.totals = Some(Totals::zero(e.currency));
                self.created = true;
            }
            InvoiceEvent::LineItemAdded(e) => {
                self.next_line_no = self.next_line_no.max(e.line.line_no() + 1);
                self.lines.push(e.line.clone());
            }
            InvoiceEvent::LineItemRemoved(e) => {
                self.lines.retain(|l| l.line_no() != e.line_no);
            }
            InvoiceEvent::InvoiceTotalsRecalculated(e) => {
                self.totals = Some(e.totals);
            }
            InvoiceEvent::InvoiceApproved(e) => {
                self.status = InvoiceStatus::Approved;
                self.document_number = Some(e.document_number);
                self.totals = Some(e.totals);
            }
            InvoiceEvent::InvoiceCancelled(e) => {
                self.status = InvoiceStatus::Cancelled;
                self.cancelled_reason = Some(e.reason.clone());
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InvoiceCommand::CreateInvoice(cmd) => self.handle_create(cmd),
            InvoiceCommand::AddLineItem(cmd) => self.handle_add_line_item(cmd),
            InvoiceCommand::RemoveLineItem(cmd) => self.handle_remove_line_item(cmd),
            InvoiceCommand::ApproveInvoice(cmd) => self.handle_approve(cmd),
            InvoiceCommand::CancelInvoice(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Invoice {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_invoice_id(&self, invoice_id: InvoiceId) -> Result<(), DomainError> {
        if self.id != invoice_id {
            return Err(DomainError::invariant("invoice_id mismatch"));
        }
        Ok(())
    }

    fn ensure_draft(&self, what: &str) -> Result<(), DomainError> {
        if self.status != InvoiceStatus::Draft {
            return Err(DomainError::invariant(format!(
                "{what} is only allowed while the invoice is draft (status: {})",
                self.status
            )));
        }
        Ok(())
    }

    /// Recompute totals for a prospective set of lines.
    ///
    /// Only called from `handle`, with `created` already established, so the
    /// currency/issue date are present.
    fn recompute_totals(&self, lines: &[LineItem]) -> Result<Totals, DomainError> {
        let currency = self
            .currency
            .ok_or_else(|| DomainError::invariant("invoice has no currency before creation"))?;
        let issue_date = self
            .issue_date
            .ok_or_else(|| DomainError::invariant("invoice has no issue date before creation"))?;

        let zero = Money::zero(currency);
        let subtotal = lines.iter().fold(zero, |acc, l| acc + l.net());
        let withholding = compute_withholding(subtotal, &self.rules, issue_date);
        Ok(Totals::from_lines(currency, lines, withholding))
    }

    fn handle_create(&self, cmd: &CreateInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("invoice already exists"));
        }
        if cmd.due_date < cmd.issue_date {
            return Err(DomainError::validation(format!(
                "due date {} precedes issue date {}",
                cmd.due_date, cmd.issue_date
            )));
        }

        Ok(vec![InvoiceEvent::InvoiceCreated(InvoiceCreated {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            currency: cmd.currency,
            issue_date: cmd.issue_date,
            due_date: cmd.due_date,
            fiscal_period: FiscalPeriod::from_date(cmd.issue_date),
            counterparty_tax_id: cmd.counterparty_tax_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_add_line_item(&self, cmd: &AddLineItem) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_invoice_id(cmd.invoice_id)?;
        self.ensure_draft("adding a line item")?;

        let currency = self
            .currency
            .ok_or_else(|| DomainError::invariant("invoice has no currency"))?;
        if cmd.unit_price.currency() != currency {
            return Err(DomainError::validation(format!(
                "line currency {} does not match invoice currency {}",
                cmd.unit_price.currency(),
                currency
            )));
        }
        let issue_date = self
            .issue_date
            .ok_or_else(|| DomainError::invariant("invoice has no issue date"))?;

        let taxes = compute_line(
            &LineInput {
                quantity: cmd.quantity,
                unit_price: cmd.unit_price,
                category: cmd.tax_category,
            },
            &self.rules,
            issue_date,
        )?;
        let line = LineItem::priced(
            self.next_line_no,
            cmd.description.clone(),
            cmd.quantity,
            cmd.unit_price,
            cmd.tax_category,
            taxes,
        )?;

        let mut lines = self.lines.clone();
        lines.push(line.clone());
        let totals = self.recompute_totals(&lines)?;

        Ok(vec![
            InvoiceEvent::LineItemAdded(LineItemAdded {
                tenant_id: cmd.tenant_id,
                invoice_id: cmd.invoice_id,
                line,
                occurred_at: cmd.occurred_at,
            }),
            InvoiceEvent::InvoiceTotalsRecalculated(InvoiceTotalsRecalculated {
                tenant_id: cmd.tenant_id,
                invoice_id: cmd.invoice_id,
                totals,
                occurred_at: cmd.occurred_at,
            }),
        ])
    }

    fn handle_remove_line_item(
        &self,
        cmd: &RemoveLineItem,
    ) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_invoice_id(cmd.invoice_id)?;
        self.ensure_draft("removing a line item")?;

        if !self.lines.iter().any(|l| l.line_no() == cmd.line_no) {
            return Err(DomainError::validation(format!(
                "no line item with number {}",
                cmd.line_no
            )));
        }

        let lines: Vec<LineItem> = self
            .lines
            .iter()
            .filter(|l| l.line_no() != cmd.line_no)
            .cloned()
            .collect();
        let totals = self.recompute_totals(&lines)?;

        Ok(vec![
            InvoiceEvent::LineItemRemoved(LineItemRemoved {
                tenant_id: cmd.tenant_id,
                invoice_id: cmd.invoice_id,
                line_no: cmd.line_no,
                occurred_at: cmd.occurred_at,
            }),
            InvoiceEvent::InvoiceTotalsRecalculated(InvoiceTotalsRecalculated {
                tenant_id: cmd.tenant_id,
                invoice_id: cmd.invoice_id,
                totals,
                occurred_at: cmd.occurred_at,
            }),
        ])
    }

    fn handle_approve(&self, cmd: &ApproveInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_invoice_id(cmd.invoice_id)?;
        self.ensure_draft("approval")?;

        if self.lines.is_empty() {
            return Err(DomainError::invariant(
                "cannot approve an invoice without line items",
            ));
        }

        let totals = self.recompute_totals(&self.lines)?;
        if totals.any_negative() {
            return Err(DomainError::invariant(
                "cannot approve an invoice with negative totals",
            ));
        }

        if Some(cmd.document_number.period()) != self.fiscal_period {
            return Err(DomainError::invariant(format!(
                "document number {} does not belong to fiscal period {}",
                cmd.document_number,
                self.fiscal_period.map(|p| p.to_string()).unwrap_or_default()
            )));
        }

        Ok(vec![InvoiceEvent::InvoiceApproved(InvoiceApproved {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            document_number: cmd.document_number,
            approved_by: cmd.approved_by,
            totals,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelInvoice) -> Result<Vec<InvoiceEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_invoice_id(cmd.invoice_id)?;

        if self.status == InvoiceStatus::Cancelled {
            return Err(DomainError::conflict("invoice is already cancelled"));
        }
        if cmd.settled {
            return Err(DomainError::invariant(
                "cannot cancel an externally settled invoice",
            ));
        }
        if cmd.reason.trim().is_empty() {
            return Err(DomainError::validation("cancellation requires a reason"));
        }

        Ok(vec![InvoiceEvent::InvoiceCancelled(InvoiceCancelled {
            tenant_id: cmd.tenant_id,
            invoice_id: cmd.invoice_id,
            reason: cmd.reason.clone(),
            cancelled_by: cmd.cancelled_by,
            occurred_at: cmd.occurred_at,
        })])
    }
}
