//! Invoice read-model projection.
//!
//! Consumes invoice event envelopes (from the outbox relay via the event
//! bus, or straight from the store during a rebuild) and maintains one
//! denormalized row per invoice. Delivery is at-least-once and may repeat,
//! so each row carries the sequence number and id of the last event applied
//! to it: stale and duplicate deliveries are skipped, gaps are refused.

use serde_json::Value as JsonValue;
use thiserror::Error;

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use fakturo_core::{AggregateId, Currency, Money, TenantId};
use fakturo_events::EventEnvelope;
use fakturo_invoicing::{
    DocumentNumber, FiscalPeriod, InvoiceEvent, InvoiceId, InvoiceStatus, LineItem, TaxIdentifier,
};

use crate::dispatch::INVOICE_AGGREGATE_TYPE;
use crate::read_model::TenantStore;

/// Denormalized invoice row, one per invoice per tenant.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceReadModel {
    pub invoice_id: InvoiceId,
    pub tenant_id: TenantId,
    pub status: InvoiceStatus,
    pub currency: Currency,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    pub fiscal_period: FiscalPeriod,
    pub counterparty_tax_id: Option<TaxIdentifier>,
    pub document_number: Option<DocumentNumber>,
    pub lines: Vec<LineItem>,
    pub subtotal: Money,
    pub tax: Money,
    pub levies: Money,
    pub grand_total: Money,
    pub withholding: Money,
    pub amount_due: Money,
    pub cancelled_reason: Option<String>,
    /// Sequence number of the last event folded into this row.
    pub last_sequence: u64,
    /// Id of the last event folded into this row.
    pub last_event_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum InvoiceProjectionError {
    #[error("failed to deserialize invoice event: {0}")]
    Deserialize(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error("sequence gap for {aggregate_id}: last applied {last}, got {found}")]
    SequenceGap {
        aggregate_id: AggregateId,
        last: u64,
        found: u64,
    },
}

/// Folds invoice events into [`InvoiceReadModel`] rows.
#[derive(Debug)]
pub struct InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    store: S,
}

impl<S> InvoicesProjection<S>
where
    S: TenantStore<InvoiceId, InvoiceReadModel>,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn get(&self, tenant_id: TenantId, invoice_id: &InvoiceId) -> Option<InvoiceReadModel> {
        self.store.get(tenant_id, invoice_id)
    }

    pub fn list(&self, tenant_id: TenantId) -> Vec<InvoiceReadModel> {
        self.store.list(tenant_id)
    }

    /// Fold one envelope into the read model.
    ///
    /// Envelopes for other aggregate types are ignored. Duplicates and
    /// stale redeliveries are skipped by the per-row sequence guard; an
    /// envelope that would skip ahead is an error, because applying it
    /// would publish a row that never existed.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), InvoiceProjectionError> {
        if envelope.aggregate_type() != INVOICE_AGGREGATE_TYPE {
            return Ok(());
        }

        let tenant_id = envelope.tenant_id();
        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let event: InvoiceEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| InvoiceProjectionError::Deserialize(e.to_string()))?;

        if event.tenant_id() != tenant_id {
            return Err(InvoiceProjectionError::TenantIsolation(
                "event tenant_id does not match envelope tenant_id".to_string(),
            ));
        }
        let invoice_id = event.invoice_id();
        if invoice_id.0 != aggregate_id {
            return Err(InvoiceProjectionError::TenantIsolation(
                "event invoice_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let row = self.store.get(tenant_id, &invoice_id);
        let last = row.as_ref().map(|r| r.last_sequence).unwrap_or(0);
        if seq == 0 || seq > last + 1 {
            return Err(InvoiceProjectionError::SequenceGap {
                aggregate_id,
                last,
                found: seq,
            });
        }
        if seq <= last {
            return Ok(());
        }

        let mut row = match (event, row) {
            (InvoiceEvent::InvoiceCreated(e), _) => {
                let zero = Money::zero(e.currency);
                InvoiceReadModel {
                    invoice_id: e.invoice_id,
                    tenant_id: e.tenant_id,
                    status: InvoiceStatus::Draft,
                    currency: e.currency,
                    issue_date: e.issue_date,
                    due_date: e.due_date,
                    fiscal_period: e.fiscal_period,
                    counterparty_tax_id: e.counterparty_tax_id,
                    document_number: None,
                    lines: Vec::new(),
                    subtotal: zero,
                    tax: zero,
                    levies: zero,
                    grand_total: zero,
                    withholding: zero,
                    amount_due: zero,
                    cancelled_reason: None,
                    last_sequence: 0,
                    last_event_id: Uuid::nil(),
                    updated_at: envelope.occurred_at(),
                }
            }
            (_, None) => {
                // A stream cannot start with anything but creation.
                return Err(InvoiceProjectionError::SequenceGap {
                    aggregate_id,
                    last: 0,
                    found: seq,
                });
            }
            (InvoiceEvent::LineItemAdded(e), Some(mut row)) => {
                row.lines.push(e.line);
                row
            }
            (InvoiceEvent::LineItemRemoved(e), Some(mut row)) => {
                row.lines.retain(|l| l.line_no() != e.line_no);
                row
            }
            (InvoiceEvent::InvoiceTotalsRecalculated(e), Some(mut row)) => {
                row.subtotal = e.totals.subtotal();
                row.tax = e.totals.tax();
                row.levies = e.totals.levies();
                row.grand_total = e.totals.grand_total();
                row.withholding = e.totals.withholding();
                row.amount_due = e.totals.amount_due();
                row
            }
            (InvoiceEvent::InvoiceApproved(e), Some(mut row)) => {
                row.status = InvoiceStatus::Approved;
                row.document_number = Some(e.document_number);
                row.subtotal = e.totals.subtotal();
                row.tax = e.totals.tax();
                row.levies = e.totals.levies();
                row.grand_total = e.totals.grand_total();
                row.withholding = e.totals.withholding();
                row.amount_due = e.totals.amount_due();
                row
            }
            (InvoiceEvent::InvoiceCancelled(e), Some(mut row)) => {
                row.status = InvoiceStatus::Cancelled;
                row.cancelled_reason = Some(e.reason);
                row
            }
        };

        row.last_sequence = seq;
        row.last_event_id = envelope.event_id();
        row.updated_at = Utc::now();
        self.store.upsert(tenant_id, invoice_id, row);
        Ok(())
    }

    /// Wipe and rebuild the rows of every tenant present in `envelopes`.
    ///
    /// Replays in `(tenant, aggregate, sequence)` order, so any bag of
    /// envelopes covering whole streams produces the same rows.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), InvoiceProjectionError> {
        let mut envelopes: Vec<_> = envelopes.into_iter().collect();

        let mut tenants: Vec<_> = envelopes.iter().map(|e| e.tenant_id()).collect();
        tenants.sort_by_key(|t| *t.as_uuid().as_bytes());
        tenants.dedup();
        for tenant_id in tenants {
            self.store.clear_tenant(tenant_id);
        }

        envelopes.sort_by_key(|e| {
            (
                *e.tenant_id().as_uuid().as_bytes(),
                *e.aggregate_id().as_uuid().as_bytes(),
                e.sequence_number(),
            )
        });

        for envelope in &envelopes {
            self.apply_envelope(envelope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use chrono::NaiveDate;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use fakturo_events::EventMetadata;
    use fakturo_invoicing::{InvoiceCreated, LineItemAdded};
    use fakturo_tax::{
        JurisdictionRules, LineInput, RateBand, TaxCategory, WithholdingRule, compute_line,
    };

    use crate::read_model::InMemoryTenantStore;

    type Projection = InvoicesProjection<Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>>;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn projection() -> (Projection, Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>) {
        let store = Arc::new(InMemoryTenantStore::new());
        (InvoicesProjection::new(store.clone()), store)
    }

    fn rules() -> JurisdictionRules {
        let from = date(2020, 1, 1);
        JurisdictionRules::new(
            "NL",
            1,
            vec![
                RateBand::new(TaxCategory::Standard, dec!(0.21), dec!(0.005), "standard", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Reduced, dec!(0.09), dec!(0), "reduced", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Minimal, dec!(0.04), dec!(0), "minimal", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Exempt, dec!(0), dec!(0), "exempt", from, None).unwrap(),
            ],
            vec![WithholdingRule::new(dec!(0.02), "wht", from, None).unwrap()],
        )
        .unwrap()
    }

    fn envelope(
        tenant_id: TenantId,
        invoice_id: InvoiceId,
        seq: u64,
        event: &InvoiceEvent,
    ) -> EventEnvelope<JsonValue> {
        let metadata = EventMetadata::for_event(event, Uuid::now_v7(), None);
        EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            invoice_id.0,
            INVOICE_AGGREGATE_TYPE.to_string(),
            seq,
            metadata,
            serde_json::to_value(event).unwrap(),
        )
    }

    fn created(tenant_id: TenantId, invoice_id: InvoiceId) -> InvoiceEvent {
        let issue_date = date(2025, 1, 10);
        InvoiceEvent::InvoiceCreated(InvoiceCreated {
            tenant_id,
            invoice_id,
            currency: Currency::EUR,
            issue_date,
            due_date: date(2025, 1, 25),
            fiscal_period: FiscalPeriod::from_date(issue_date),
            counterparty_tax_id: None,
            occurred_at: Utc::now(),
        })
    }

    fn line_added(tenant_id: TenantId, invoice_id: InvoiceId) -> InvoiceEvent {
        let rules = rules();
        let unit_price = Money::new(dec!(100), Currency::EUR).unwrap();
        let input = LineInput {
            quantity: dec!(10),
            unit_price,
            category: TaxCategory::Standard,
        };
        let taxes = compute_line(&input, &rules, date(2025, 1, 10)).unwrap();
        let line =
            LineItem::priced(1, "consulting", dec!(10), unit_price, TaxCategory::Standard, taxes)
                .unwrap();
        InvoiceEvent::LineItemAdded(LineItemAdded {
            tenant_id,
            invoice_id,
            line,
            occurred_at: Utc::now(),
        })
    }

    #[test]
    fn creation_then_line_builds_the_row() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        projection
            .apply_envelope(&envelope(tenant_id, invoice_id, 1, &created(tenant_id, invoice_id)))
            .unwrap();
        projection
            .apply_envelope(&envelope(tenant_id, invoice_id, 2, &line_added(tenant_id, invoice_id)))
            .unwrap();

        let row = projection.get(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.status, InvoiceStatus::Draft);
        assert_eq!(row.lines.len(), 1);
        assert_eq!(row.last_sequence, 2);
        assert_eq!(row.fiscal_period.to_string(), "2025-01");
    }

    #[test]
    fn duplicate_deliveries_change_nothing() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        let first = envelope(tenant_id, invoice_id, 1, &created(tenant_id, invoice_id));
        let second = envelope(tenant_id, invoice_id, 2, &line_added(tenant_id, invoice_id));

        projection.apply_envelope(&first).unwrap();
        projection.apply_envelope(&second).unwrap();
        let before = projection.get(tenant_id, &invoice_id).unwrap();

        // Redeliver both, out of order for good measure.
        projection.apply_envelope(&second).unwrap();
        projection.apply_envelope(&first).unwrap();

        let after = projection.get(tenant_id, &invoice_id).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.last_event_id, second.event_id());
    }

    #[test]
    fn sequence_gaps_are_refused() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        projection
            .apply_envelope(&envelope(tenant_id, invoice_id, 1, &created(tenant_id, invoice_id)))
            .unwrap();

        let skipped = envelope(tenant_id, invoice_id, 3, &line_added(tenant_id, invoice_id));
        let err = projection.apply_envelope(&skipped).unwrap_err();
        assert!(matches!(
            err,
            InvoiceProjectionError::SequenceGap { last: 1, found: 3, .. }
        ));
    }

    #[test]
    fn streams_must_begin_with_creation() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        let orphan = envelope(tenant_id, invoice_id, 1, &line_added(tenant_id, invoice_id));
        let err = projection.apply_envelope(&orphan).unwrap_err();
        assert!(matches!(err, InvoiceProjectionError::SequenceGap { .. }));
    }

    #[test]
    fn mismatched_tenant_is_rejected() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        // Envelope stamped for a different tenant than the event body.
        let envelope = envelope(TenantId::new(), invoice_id, 1, &created(tenant_id, invoice_id));
        let err = projection.apply_envelope(&envelope).unwrap_err();
        assert!(matches!(err, InvoiceProjectionError::TenantIsolation(_)));
    }

    #[test]
    fn foreign_aggregate_types_are_ignored() {
        let (projection, store) = projection();
        let tenant_id = TenantId::new();

        let metadata = EventMetadata::new(
            "payments.payment.recorded".to_string(),
            1,
            Utc::now(),
            Uuid::now_v7(),
            None,
        );
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            tenant_id,
            AggregateId::new(),
            "payments.payment".to_string(),
            1,
            metadata,
            serde_json::json!({"amount": 1}),
        );

        projection.apply_envelope(&envelope).unwrap();
        assert!(store.list(tenant_id).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..Default::default() })]

        /// At-least-once delivery: redelivering any already-applied envelope,
        /// any number of times and at any point, leaves the row identical to
        /// a clean single-delivery run.
        #[test]
        fn redelivery_noise_never_changes_the_row(
            schedule in prop::collection::vec(any::<(bool, u8)>(), 0..24)
        ) {
            let tenant_id = TenantId::new();
            let invoice_id = InvoiceId::new(AggregateId::new());
            let stream = vec![
                envelope(tenant_id, invoice_id, 1, &created(tenant_id, invoice_id)),
                envelope(tenant_id, invoice_id, 2, &line_added(tenant_id, invoice_id)),
                envelope(tenant_id, invoice_id, 3, &line_added(tenant_id, invoice_id)),
            ];

            let (noisy, _) = projection();
            let mut delivered = 0usize;
            for (advance, pick) in schedule {
                if advance && delivered < stream.len() {
                    noisy.apply_envelope(&stream[delivered]).unwrap();
                    delivered += 1;
                } else if delivered > 0 {
                    let idx = usize::from(pick) % delivered;
                    noisy.apply_envelope(&stream[idx]).unwrap();
                }
            }
            for envelope in &stream[delivered..] {
                noisy.apply_envelope(envelope).unwrap();
            }

            let (clean, _) = projection();
            for envelope in &stream {
                clean.apply_envelope(envelope).unwrap();
            }

            let noisy_row = noisy.get(tenant_id, &invoice_id).unwrap();
            let mut clean_row = clean.get(tenant_id, &invoice_id).unwrap();
            clean_row.updated_at = noisy_row.updated_at;
            prop_assert_eq!(noisy_row, clean_row);
        }
    }

    #[test]
    fn rebuild_replaces_existing_rows_deterministically() {
        let (projection, _) = projection();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        let first = envelope(tenant_id, invoice_id, 1, &created(tenant_id, invoice_id));
        let second = envelope(tenant_id, invoice_id, 2, &line_added(tenant_id, invoice_id));

        projection.apply_envelope(&first).unwrap();
        projection.apply_envelope(&second).unwrap();

        // Shuffled input; rebuild sorts before applying.
        projection
            .rebuild_from_scratch(vec![second.clone(), first.clone()])
            .unwrap();

        let row = projection.get(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.last_sequence, 2);
        assert_eq!(row.lines.len(), 1);
        assert_eq!(row.last_event_id, second.event_id());
    }
}
