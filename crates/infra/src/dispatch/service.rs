//! Application service for invoice commands.
//!
//! One public method per command. Every call runs the same frame:
//!
//! 1. reserve the caller's idempotency key (a replayed outcome returns here);
//! 2. build the domain command and dispatch it through [`CommandDispatcher`];
//! 3. record the outcome under the key, or release the key on transient
//!    failure so the caller's retry can run.
//!
//! Approval additionally allocates the invoice's document number from the
//! per-`(tenant, fiscal period)` counter right before dispatch. The counter
//! never rolls back, so an approval that loses its optimistic concurrency
//! race leaves a hole in the issued numbers rather than a duplicate.

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{instrument, warn};
use uuid::Uuid;

use fakturo_core::{Currency, Money, TenantId, UserId};
use fakturo_invoicing::{
    AddLineItem, ApproveInvoice, CancelInvoice, CreateInvoice, DocumentNumber, Invoice,
    InvoiceCommand, InvoiceId, InvoiceStatus, RemoveLineItem, TaxIdentifier,
};
use fakturo_tax::{JurisdictionRules, TaxCategory};

use crate::dispatch::dispatcher::{
    CommandDispatcher, DispatchContext, DispatchError, DispatchOutcome, DispatcherConfig,
    rehydrate,
};
use crate::dispatch::idempotency::{
    CommandOutcome, CommandReceipt, IdempotencyStore, Reservation,
};
use crate::event_store::EventStore;

/// Stream type under which invoice aggregates are stored.
pub const INVOICE_AGGREGATE_TYPE: &str = "invoicing.invoice";

/// Per-request execution context.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub tenant_id: TenantId,
    pub actor: UserId,
    /// Ties every event of this request to the same trace.
    pub correlation_id: Uuid,
    /// Client-chosen key that makes the request safely retryable.
    pub idempotency_key: String,
    pub deadline: Option<Instant>,
}

impl CommandContext {
    pub fn new(tenant_id: TenantId, actor: UserId, idempotency_key: impl Into<String>) -> Self {
        Self {
            tenant_id,
            actor,
            correlation_id: Uuid::now_v7(),
            idempotency_key: idempotency_key.into(),
            deadline: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Command-side entry point for the invoicing domain.
pub struct InvoiceCommandService<S, I> {
    dispatcher: CommandDispatcher<S>,
    store: S,
    idempotency: I,
    rules: Arc<JurisdictionRules>,
}

impl<S, I> InvoiceCommandService<S, I>
where
    S: EventStore + Clone,
    I: IdempotencyStore,
{
    pub fn new(store: S, idempotency: I, rules: Arc<JurisdictionRules>) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store.clone()),
            store,
            idempotency,
            rules,
        }
    }

    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = CommandDispatcher::new(self.store.clone()).with_config(config);
        self
    }

    #[instrument(skip(self, ctx, counterparty_tax_id), fields(
        tenant_id = %ctx.tenant_id,
        invoice_id = %invoice_id,
    ))]
    pub async fn create_invoice(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        currency: Currency,
        issue_date: NaiveDate,
        due_date: NaiveDate,
        counterparty_tax_id: Option<TaxIdentifier>,
    ) -> Result<CommandReceipt, DispatchError> {
        if let Some(receipt) = self.begin(ctx).await? {
            return Ok(receipt);
        }
        let command = InvoiceCommand::CreateInvoice(CreateInvoice {
            tenant_id: ctx.tenant_id,
            invoice_id,
            currency,
            issue_date,
            due_date,
            counterparty_tax_id,
            occurred_at: Utc::now(),
        });
        let result = self.execute(ctx, invoice_id, command).await;
        self.finish(ctx, invoice_id, result).await
    }

    #[instrument(skip(self, ctx, description), fields(
        tenant_id = %ctx.tenant_id,
        invoice_id = %invoice_id,
    ))]
    pub async fn add_line_item(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        description: String,
        quantity: Decimal,
        unit_price: Money,
        tax_category: TaxCategory,
    ) -> Result<CommandReceipt, DispatchError> {
        if let Some(receipt) = self.begin(ctx).await? {
            return Ok(receipt);
        }
        let command = InvoiceCommand::AddLineItem(AddLineItem {
            tenant_id: ctx.tenant_id,
            invoice_id,
            description,
            quantity,
            unit_price,
            tax_category,
            occurred_at: Utc::now(),
        });
        let result = self.execute(ctx, invoice_id, command).await;
        self.finish(ctx, invoice_id, result).await
    }

    #[instrument(skip(self, ctx), fields(
        tenant_id = %ctx.tenant_id,
        invoice_id = %invoice_id,
    ))]
    pub async fn remove_line_item(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        line_no: u32,
    ) -> Result<CommandReceipt, DispatchError> {
        if let Some(receipt) = self.begin(ctx).await? {
            return Ok(receipt);
        }
        let command = InvoiceCommand::RemoveLineItem(RemoveLineItem {
            tenant_id: ctx.tenant_id,
            invoice_id,
            line_no,
            occurred_at: Utc::now(),
        });
        let result = self.execute(ctx, invoice_id, command).await;
        self.finish(ctx, invoice_id, result).await
    }

    #[instrument(skip(self, ctx), fields(
        tenant_id = %ctx.tenant_id,
        invoice_id = %invoice_id,
    ))]
    pub async fn approve_invoice(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
    ) -> Result<CommandReceipt, DispatchError> {
        if let Some(receipt) = self.begin(ctx).await? {
            return Ok(receipt);
        }
        let result = self.approve_inner(ctx, invoice_id).await;
        self.finish(ctx, invoice_id, result).await
    }

    #[instrument(skip(self, ctx, reason), fields(
        tenant_id = %ctx.tenant_id,
        invoice_id = %invoice_id,
    ))]
    pub async fn cancel_invoice(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        reason: String,
        settled: bool,
    ) -> Result<CommandReceipt, DispatchError> {
        if let Some(receipt) = self.begin(ctx).await? {
            return Ok(receipt);
        }
        let command = InvoiceCommand::CancelInvoice(CancelInvoice {
            tenant_id: ctx.tenant_id,
            invoice_id,
            reason,
            cancelled_by: ctx.actor,
            settled,
            occurred_at: Utc::now(),
        });
        let result = self.execute(ctx, invoice_id, command).await;
        self.finish(ctx, invoice_id, result).await
    }

    /// Claim the context's idempotency key. A recorded outcome replays
    /// without executing anything.
    async fn begin(&self, ctx: &CommandContext) -> Result<Option<CommandReceipt>, DispatchError> {
        match self
            .idempotency
            .reserve(ctx.tenant_id, &ctx.idempotency_key)
            .await?
        {
            Reservation::Fresh => Ok(None),
            Reservation::InFlight => Err(DispatchError::IdempotencyInFlight),
            Reservation::Completed(CommandOutcome::Completed(receipt)) => Ok(Some(receipt)),
            Reservation::Completed(CommandOutcome::Rejected { code, message }) => {
                Err(rejection_from_code(&code, message))
            }
        }
    }

    async fn execute(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        command: InvoiceCommand,
    ) -> Result<DispatchOutcome, DispatchError> {
        let rules = self.rules.clone();
        let context = dispatch_context(ctx);
        self.dispatcher
            .dispatch(
                ctx.tenant_id,
                invoice_id.0,
                INVOICE_AGGREGATE_TYPE,
                command,
                &context,
                move |_, id| Invoice::empty(InvoiceId::new(id), rules.clone()),
            )
            .await
    }

    /// Approval allocates the document number before dispatching, so the
    /// current state is inspected first: rejecting a doomed approval here
    /// costs nothing, while rejecting it inside the aggregate would already
    /// have burned a number.
    async fn approve_inner(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
    ) -> Result<DispatchOutcome, DispatchError> {
        let history = self.store.load_stream(ctx.tenant_id, invoice_id.0).await?;
        let mut invoice = Invoice::empty(invoice_id, self.rules.clone());
        rehydrate(&mut invoice, &history)?;

        if !invoice.is_created() {
            return Err(DispatchError::NotFound);
        }
        if invoice.status() != InvoiceStatus::Draft {
            return Err(DispatchError::InvariantViolation(format!(
                "only draft invoices can be approved, status is {}",
                invoice.status()
            )));
        }
        if invoice.lines().is_empty() {
            return Err(DispatchError::InvariantViolation(
                "cannot approve an invoice with no line items".to_string(),
            ));
        }
        let period = invoice.fiscal_period().ok_or_else(|| {
            DispatchError::InvariantViolation("created invoice has no fiscal period".to_string())
        })?;

        let sequence = self
            .store
            .next_sequence(ctx.tenant_id, &period.to_string())
            .await?;
        let document_number = DocumentNumber::from_sequence(period, sequence)?;

        let command = InvoiceCommand::ApproveInvoice(ApproveInvoice {
            tenant_id: ctx.tenant_id,
            invoice_id,
            approved_by: ctx.actor,
            document_number,
            occurred_at: Utc::now(),
        });
        self.execute(ctx, invoice_id, command).await
    }

    /// Record the outcome under the key, or release the key.
    ///
    /// Deterministic business rejections are recorded so a replay sees the
    /// same answer. Transient failures release the key; bookkeeping failures
    /// are logged and never mask the primary result.
    async fn finish(
        &self,
        ctx: &CommandContext,
        invoice_id: InvoiceId,
        result: Result<DispatchOutcome, DispatchError>,
    ) -> Result<CommandReceipt, DispatchError> {
        match result {
            Ok(outcome) => {
                let receipt = CommandReceipt {
                    invoice_id,
                    version: outcome.version,
                };
                if let Err(e) = self
                    .idempotency
                    .complete(
                        ctx.tenant_id,
                        &ctx.idempotency_key,
                        CommandOutcome::Completed(receipt.clone()),
                    )
                    .await
                {
                    warn!(error = %e, "failed to record command outcome");
                }
                Ok(receipt)
            }
            Err(err) if is_recordable_rejection(&err) => {
                let outcome = CommandOutcome::Rejected {
                    code: err.code().to_string(),
                    message: err.to_string(),
                };
                if let Err(e) = self
                    .idempotency
                    .complete(ctx.tenant_id, &ctx.idempotency_key, outcome)
                    .await
                {
                    warn!(error = %e, "failed to record command rejection");
                }
                Err(err)
            }
            Err(err) => {
                if let Err(e) = self
                    .idempotency
                    .release(ctx.tenant_id, &ctx.idempotency_key)
                    .await
                {
                    warn!(error = %e, "failed to release idempotency key");
                }
                Err(err)
            }
        }
    }
}

fn dispatch_context(ctx: &CommandContext) -> DispatchContext {
    let mut context = DispatchContext::new(ctx.correlation_id);
    if let Some(deadline) = ctx.deadline {
        context = context.with_deadline(deadline);
    }
    context
}

/// Rejections that are the same on every retry get recorded and replayed.
fn is_recordable_rejection(err: &DispatchError) -> bool {
    matches!(
        err,
        DispatchError::Validation(_)
            | DispatchError::InvariantViolation(_)
            | DispatchError::Conflict(_)
            | DispatchError::NotFound
            | DispatchError::Unauthorized
    )
}

fn rejection_from_code(code: &str, message: String) -> DispatchError {
    match code {
        "validation_failed" => DispatchError::Validation(message),
        "business_rule_violated" => DispatchError::InvariantViolation(message),
        "conflict" => DispatchError::Conflict(message),
        "not_found" => DispatchError::NotFound,
        "unauthorized" => DispatchError::Unauthorized,
        _ => DispatchError::InvariantViolation(message),
    }
}
