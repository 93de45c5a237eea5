//! End-to-end tests for the invoicing pipeline.
//!
//! Command service → event store (with outbox) → relay → bus → projection
//! → queries, all on the in-memory backends. The relay is pumped manually
//! so every test is deterministic: drain one pass, then fold whatever
//! reached the subscription into the read model.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;
    use uuid::Uuid;

    use fakturo_core::{AggregateId, Currency, ExpectedVersion, Money, TenantId, UserId};
    use fakturo_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
    use fakturo_invoicing::{FiscalPeriod, InvoiceCreated, InvoiceEvent, InvoiceId, InvoiceStatus};
    use fakturo_tax::{JurisdictionRules, RateBand, TaxCategory, WithholdingRule};

    use crate::dispatch::{
        CommandContext, DispatchError, INVOICE_AGGREGATE_TYPE, InMemoryIdempotencyStore,
        InvoiceCommandService,
    };
    use crate::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
    use crate::outbox::{
        BusEventPublisher, DrainReport, EventPublisher, OutboxRelay, OutboxStore, PublishError,
    };
    use crate::projections::{InvoiceReadModel, InvoicesProjection};
    use crate::query::{InvoiceFilter, InvoiceQueries, Pagination, QueryError};
    use crate::read_model::{InMemoryTenantStore, TenantStore};
    use crate::workers::ProjectionWorker;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Rows = Arc<InMemoryTenantStore<InvoiceId, InvoiceReadModel>>;
    type Service = InvoiceCommandService<Arc<InMemoryEventStore>, Arc<InMemoryIdempotencyStore>>;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn eur(amount: rust_decimal::Decimal) -> Money {
        Money::new(amount, Currency::EUR).unwrap()
    }

    fn test_rules() -> Arc<JurisdictionRules> {
        let from = date(2020, 1, 1);
        Arc::new(
            JurisdictionRules::new(
                "NL",
                1,
                vec![
                    RateBand::new(TaxCategory::Standard, dec!(0.21), dec!(0.005), "standard 21%", from, None)
                        .unwrap(),
                    RateBand::new(TaxCategory::Reduced, dec!(0.09), dec!(0.005), "reduced 9%", from, None)
                        .unwrap(),
                    RateBand::new(TaxCategory::Minimal, dec!(0.04), dec!(0), "minimal 4%", from, None)
                        .unwrap(),
                    RateBand::new(TaxCategory::Exempt, dec!(0), dec!(0), "exempt", from, None).unwrap(),
                ],
                vec![WithholdingRule::new(dec!(0.02), "wht 2%", from, None).unwrap()],
            )
            .unwrap(),
        )
    }

    /// Everything wired together, with the relay pumped by hand.
    struct Pipeline {
        store: Arc<InMemoryEventStore>,
        bus: Bus,
        service: Service,
        relay: OutboxRelay<Arc<InMemoryEventStore>, BusEventPublisher<Bus>>,
        projection: InvoicesProjection<Rows>,
        rows: Rows,
        subscription: Subscription<EventEnvelope<JsonValue>>,
    }

    impl Pipeline {
        fn new() -> Self {
            fakturo_observability::init();

            let store = Arc::new(InMemoryEventStore::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            // Subscribe before anything publishes, or messages are lost.
            let subscription = bus.subscribe();

            let service = InvoiceCommandService::new(
                store.clone(),
                Arc::new(InMemoryIdempotencyStore::new()),
                test_rules(),
            );
            let relay = OutboxRelay::new(store.clone(), BusEventPublisher::new(bus.clone()));
            let rows: Rows = Arc::new(InMemoryTenantStore::new());
            let projection = InvoicesProjection::new(rows.clone());

            Self {
                store,
                bus,
                service,
                relay,
                projection,
                rows,
                subscription,
            }
        }

        /// One relay pass, then fold everything it published.
        async fn pump(&self) -> DrainReport {
            let report = self.relay.drain_once().await.unwrap();
            while let Ok(envelope) = self.subscription.try_recv() {
                self.projection.apply_envelope(&envelope).unwrap();
            }
            report
        }

        fn queries(&self) -> InvoiceQueries<Rows> {
            InvoiceQueries::new(self.rows.clone())
        }
    }

    fn ctx(tenant_id: TenantId, key: &str) -> CommandContext {
        CommandContext::new(tenant_id, UserId::new(), key)
    }

    async fn create_invoice(pipeline: &Pipeline, tenant_id: TenantId, key: &str) -> InvoiceId {
        let invoice_id = InvoiceId::new(AggregateId::new());
        pipeline
            .service
            .create_invoice(
                &ctx(tenant_id, key),
                invoice_id,
                Currency::EUR,
                date(2025, 1, 10),
                date(2025, 1, 25),
                None,
            )
            .await
            .unwrap();
        invoice_id
    }

    async fn add_consulting_line(pipeline: &Pipeline, tenant_id: TenantId, invoice_id: InvoiceId, key: &str) {
        pipeline
            .service
            .add_line_item(
                &ctx(tenant_id, key),
                invoice_id,
                "consulting".to_string(),
                dec!(10),
                eur(dec!(100)),
                TaxCategory::Standard,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lifecycle_flows_from_command_to_query() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();

        let invoice_id = create_invoice(&pipeline, tenant_id, "create").await;
        add_consulting_line(&pipeline, tenant_id, invoice_id, "add").await;
        pipeline
            .service
            .approve_invoice(&ctx(tenant_id, "approve"), invoice_id)
            .await
            .unwrap();

        let report = pipeline.pump().await;
        // created + line added + totals recalculated + approved
        assert_eq!(report.published, 4);
        assert_eq!(report.retry_after, None);

        let row = pipeline.queries().get_invoice(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.status, InvoiceStatus::Approved);
        assert_eq!(
            row.document_number.unwrap().to_string(),
            "INV-2025-01-000001"
        );
        assert_eq!(row.lines.len(), 1);
        assert_eq!(row.subtotal, eur(dec!(1000.00)));
        assert_eq!(row.tax, eur(dec!(210.00)));
        assert_eq!(row.levies, eur(dec!(5.00)));
        assert_eq!(row.grand_total, eur(dec!(1215.00)));
        assert_eq!(row.withholding, eur(dec!(20.00)));
        assert_eq!(row.amount_due, eur(dec!(1195.00)));
        assert_eq!(row.last_sequence, 4);

        let page = pipeline.queries().list_invoices(
            tenant_id,
            &InvoiceFilter {
                status: Some(InvoiceStatus::Approved),
                fiscal_period: Some(FiscalPeriod::from_date(date(2025, 1, 10))),
                ..Default::default()
            },
            Pagination::default(),
        );
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].invoice_id, invoice_id);
    }

    #[tokio::test]
    async fn rejected_approval_leaves_stream_and_row_untouched() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();

        let invoice_id = create_invoice(&pipeline, tenant_id, "create").await;

        let err = pipeline
            .service
            .approve_invoice(&ctx(tenant_id, "approve"), invoice_id)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvariantViolation(_)));

        assert_eq!(
            pipeline
                .store
                .load_stream(tenant_id, invoice_id.0)
                .await
                .unwrap()
                .len(),
            1
        );

        pipeline.pump().await;
        let row = pipeline.queries().get_invoice(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.status, InvoiceStatus::Draft);
        assert_eq!(row.document_number, None);
    }

    #[tokio::test]
    async fn lost_optimistic_race_is_rejected_by_the_store() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());

        let issue_date = date(2025, 1, 10);
        let created = InvoiceEvent::InvoiceCreated(InvoiceCreated {
            tenant_id,
            invoice_id,
            currency: Currency::EUR,
            issue_date,
            due_date: date(2025, 1, 25),
            fiscal_period: FiscalPeriod::from_date(issue_date),
            counterparty_tax_id: None,
            occurred_at: chrono::Utc::now(),
        });
        let batch = || {
            vec![
                UncommittedEvent::from_typed(
                    tenant_id,
                    invoice_id.0,
                    INVOICE_AGGREGATE_TYPE,
                    &created,
                    Uuid::now_v7(),
                    None,
                )
                .unwrap(),
            ]
        };

        // Both writers decided against the empty stream.
        pipeline
            .store
            .append(batch(), ExpectedVersion::Exact(0))
            .await
            .unwrap();
        let err = pipeline
            .store
            .append(batch(), ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::event_store::EventStoreError::Concurrency(_)
        ));

        // The losing batch left no trace.
        assert_eq!(
            pipeline
                .store
                .load_stream(tenant_id, invoice_id.0)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(pipeline.store.fetch_unpublished(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_read_model() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();

        let invoice_id = create_invoice(&pipeline, tenant_id, "create").await;
        add_consulting_line(&pipeline, tenant_id, invoice_id, "add").await;
        pipeline
            .service
            .approve_invoice(&ctx(tenant_id, "approve"), invoice_id)
            .await
            .unwrap();
        pipeline.pump().await;

        pipeline
            .service
            .cancel_invoice(
                &ctx(tenant_id, "cancel"),
                invoice_id,
                "ordered twice".to_string(),
                false,
            )
            .await
            .unwrap();
        pipeline.pump().await;

        let row = pipeline.queries().get_invoice(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.status, InvoiceStatus::Cancelled);
        assert_eq!(row.cancelled_reason.as_deref(), Some("ordered twice"));
        // The assigned number survives cancellation for the audit trail.
        assert!(row.document_number.is_some());
    }

    #[tokio::test]
    async fn duplicate_create_is_idempotent_end_to_end() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();
        let invoice_id = InvoiceId::new(AggregateId::new());
        let context = ctx(tenant_id, "create-once");

        let first = pipeline
            .service
            .create_invoice(
                &context,
                invoice_id,
                Currency::EUR,
                date(2025, 1, 10),
                date(2025, 1, 25),
                None,
            )
            .await
            .unwrap();
        let second = pipeline
            .service
            .create_invoice(
                &context,
                invoice_id,
                Currency::EUR,
                date(2025, 1, 10),
                date(2025, 1, 25),
                None,
            )
            .await
            .unwrap();
        assert_eq!(second, first);

        // One event, one outbox entry, one row.
        assert_eq!(
            pipeline
                .store
                .load_stream(tenant_id, invoice_id.0)
                .await
                .unwrap()
                .len(),
            1
        );
        let report = pipeline.pump().await;
        assert_eq!(report.published, 1);

        let page = pipeline
            .queries()
            .list_invoices(tenant_id, &InvoiceFilter::default(), Pagination::default());
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].last_sequence, 1);
    }

    /// Publisher that fails a fixed number of times before recovering.
    struct FlakyPublisher {
        inner: BusEventPublisher<Bus>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), PublishError> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(PublishError("simulated bus outage".to_string()));
            }
            self.inner.publish(envelope).await
        }
    }

    #[tokio::test]
    async fn publish_outage_delays_but_never_loses_events() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();

        let flaky_relay = OutboxRelay::new(
            pipeline.store.clone(),
            FlakyPublisher {
                inner: BusEventPublisher::new(pipeline.bus.clone()),
                failures_left: AtomicU32::new(2),
            },
        );

        let invoice_id = create_invoice(&pipeline, tenant_id, "create").await;

        // Two failing passes: nothing published, attempts recorded, backoff
        // requested and growing.
        let first = flaky_relay.drain_once().await.unwrap();
        assert_eq!(first.published, 0);
        let first_backoff = first.retry_after.unwrap();
        let second = flaky_relay.drain_once().await.unwrap();
        assert_eq!(second.published, 0);
        assert!(second.retry_after.unwrap() >= first_backoff);
        assert_eq!(pipeline.store.fetch_unpublished(10).await.unwrap()[0].attempts, 2);
        assert!(
            pipeline
                .queries()
                .get_invoice(tenant_id, &invoice_id)
                .is_err()
        );

        // Outage over: the entry drains exactly once.
        let recovered = flaky_relay.drain_once().await.unwrap();
        assert_eq!(recovered.published, 1);
        while let Ok(envelope) = pipeline.subscription.try_recv() {
            pipeline.projection.apply_envelope(&envelope).unwrap();
        }
        let row = pipeline.queries().get_invoice(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.last_sequence, 1);
        assert!(pipeline.store.fetch_unpublished(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_are_isolated_across_the_pipeline() {
        let pipeline = Pipeline::new();
        let left = TenantId::new();
        let right = TenantId::new();

        let left_invoice = create_invoice(&pipeline, left, "create-left").await;
        let right_invoice = create_invoice(&pipeline, right, "create-right").await;
        pipeline.pump().await;

        let left_page = pipeline
            .queries()
            .list_invoices(left, &InvoiceFilter::default(), Pagination::default());
        assert_eq!(left_page.total, 1);
        assert_eq!(left_page.items[0].invoice_id, left_invoice);

        let right_page = pipeline
            .queries()
            .list_invoices(right, &InvoiceFilter::default(), Pagination::default());
        assert_eq!(right_page.total, 1);
        assert_eq!(right_page.items[0].invoice_id, right_invoice);

        assert!(matches!(
            pipeline.queries().get_invoice(left, &right_invoice),
            Err(QueryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn projection_worker_applies_relayed_events() {
        let pipeline = Pipeline::new();
        let tenant_id = TenantId::new();

        // Dedicated worker with its own subscription and row store.
        let worker_rows: Rows = Arc::new(InMemoryTenantStore::new());
        let worker_projection = Arc::new(InvoicesProjection::new(worker_rows.clone()));
        let handle = {
            let projection = worker_projection.clone();
            ProjectionWorker::spawn("invoices-projection", pipeline.bus.clone(), None, move |envelope| {
                projection.apply_envelope(&envelope)
            })
        };

        let invoice_id = create_invoice(&pipeline, tenant_id, "create").await;
        add_consulting_line(&pipeline, tenant_id, invoice_id, "add").await;
        pipeline.relay.drain_once().await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(row) = worker_rows.get(tenant_id, &invoice_id)
                && row.last_sequence == 3
            {
                break;
            }
            assert!(Instant::now() < deadline, "worker did not catch up in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown();

        let row = worker_rows.get(tenant_id, &invoice_id).unwrap();
        assert_eq!(row.lines.len(), 1);
        assert_eq!(row.subtotal, eur(dec!(1000.00)));
    }
}
