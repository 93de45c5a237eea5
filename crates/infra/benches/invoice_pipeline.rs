use criterion::{
    BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rust_decimal_macros::dec;
use serde_json::Value as JsonValue;
use tokio::runtime::Runtime;
use uuid::Uuid;

use fakturo_core::{AggregateId, Currency, ExpectedVersion, Money, TenantId, UserId};
use fakturo_events::EventEnvelope;
use fakturo_infra::dispatch::{
    CommandContext, CommandDispatcher, DispatchContext, INVOICE_AGGREGATE_TYPE,
    InMemoryIdempotencyStore, InvoiceCommandService, rehydrate,
};
use fakturo_infra::event_store::{EventStore, InMemoryEventStore, UncommittedEvent};
use fakturo_infra::outbox::{EventPublisher, OutboxRelay, PublishError, RelayConfig};
use fakturo_infra::projections::InvoicesProjection;
use fakturo_infra::read_model::InMemoryTenantStore;
use fakturo_invoicing::{
    CreateInvoice, FiscalPeriod, Invoice, InvoiceCommand, InvoiceCreated, InvoiceEvent, InvoiceId,
    LineItem, LineItemAdded,
};
use fakturo_tax::{
    JurisdictionRules, LineInput, RateBand, TaxCategory, WithholdingRule, compute_line,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn bench_rules() -> Arc<JurisdictionRules> {
    let from = date(2020, 1, 1);
    Arc::new(
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
        .unwrap(),
    )
}

fn consulting_line(line_no: u32) -> LineItem {
    let rules = bench_rules();
    let unit_price = Money::new(dec!(100), Currency::EUR).unwrap();
    let input = LineInput {
        quantity: dec!(1),
        unit_price,
        category: TaxCategory::Standard,
    };
    let taxes = compute_line(&input, &rules, date(2025, 1, 10)).unwrap();
    LineItem::priced(line_no, "consulting", dec!(1), unit_price, TaxCategory::Standard, taxes)
        .unwrap()
}

fn created_event(tenant_id: TenantId, invoice_id: InvoiceId) -> InvoiceEvent {
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

fn line_added_event(tenant_id: TenantId, invoice_id: InvoiceId, line_no: u32) -> InvoiceEvent {
    InvoiceEvent::LineItemAdded(LineItemAdded {
        tenant_id,
        invoice_id,
        line: consulting_line(line_no),
        occurred_at: Utc::now(),
    })
}

fn uncommitted(tenant_id: TenantId, invoice_id: InvoiceId, event: &InvoiceEvent) -> UncommittedEvent {
    UncommittedEvent::from_typed(
        tenant_id,
        invoice_id.0,
        INVOICE_AGGREGATE_TYPE,
        event,
        Uuid::now_v7(),
        None,
    )
    .unwrap()
}

/// One batch holding a creation plus `depth - 1` line additions.
fn stream_batch(tenant_id: TenantId, invoice_id: InvoiceId, depth: usize) -> Vec<UncommittedEvent> {
    let mut batch = vec![uncommitted(tenant_id, invoice_id, &created_event(tenant_id, invoice_id))];
    for n in 1..depth {
        batch.push(uncommitted(
            tenant_id,
            invoice_id,
            &line_added_event(tenant_id, invoice_id, n as u32),
        ));
    }
    batch
}

fn bench_command_dispatch(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("command_dispatch");
    group.sample_size(1000);

    group.bench_function("create_invoice", |b| {
        let dispatcher = CommandDispatcher::new(Arc::new(InMemoryEventStore::new()));
        let rules = bench_rules();
        let tenant_id = TenantId::new();

        b.iter(|| {
            let invoice_id = InvoiceId::new(AggregateId::new());
            let command = InvoiceCommand::CreateInvoice(CreateInvoice {
                tenant_id,
                invoice_id,
                currency: Currency::EUR,
                issue_date: date(2025, 1, 10),
                due_date: date(2025, 1, 25),
                counterparty_tax_id: None,
                occurred_at: Utc::now(),
            });
            let context = DispatchContext::new(Uuid::now_v7());
            let rules = rules.clone();
            let outcome = rt
                .block_on(dispatcher.dispatch(
                    tenant_id,
                    invoice_id.0,
                    INVOICE_AGGREGATE_TYPE,
                    command,
                    &context,
                    move |_, id| Invoice::empty(InvoiceId::new(id), rules.clone()),
                ))
                .unwrap();
            black_box(outcome.version);
        });
    });

    group.bench_function("lifecycle_via_service", |b| {
        let store = Arc::new(InMemoryEventStore::new());
        let service = InvoiceCommandService::new(
            store,
            Arc::new(InMemoryIdempotencyStore::new()),
            bench_rules(),
        );
        let tenant_id = TenantId::new();
        let actor = UserId::new();
        let mut n = 0u64;

        b.iter(|| {
            n += 1;
            let invoice_id = InvoiceId::new(AggregateId::new());
            rt.block_on(async {
                service
                    .create_invoice(
                        &CommandContext::new(tenant_id, actor, format!("create-{n}")),
                        invoice_id,
                        Currency::EUR,
                        date(2025, 1, 10),
                        date(2025, 1, 25),
                        None,
                    )
                    .await
                    .unwrap();
                service
                    .add_line_item(
                        &CommandContext::new(tenant_id, actor, format!("add-{n}")),
                        invoice_id,
                        "consulting".to_string(),
                        dec!(1),
                        Money::new(dec!(100), Currency::EUR).unwrap(),
                        TaxCategory::Standard,
                    )
                    .await
                    .unwrap();
                let receipt = service
                    .approve_invoice(
                        &CommandContext::new(tenant_id, actor, format!("approve-{n}")),
                        invoice_id,
                    )
                    .await
                    .unwrap();
                black_box(receipt.version);
            });
        });
    });

    group.finish();
}

fn bench_rehydration(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("rehydration");

    for depth in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::new("replay_stream", depth), &depth, |b, &depth| {
            let store = InMemoryEventStore::new();
            let rules = bench_rules();
            let tenant_id = TenantId::new();
            let invoice_id = InvoiceId::new(AggregateId::new());
            rt.block_on(store.append(
                stream_batch(tenant_id, invoice_id, depth),
                ExpectedVersion::Exact(0),
            ))
            .unwrap();

            b.iter(|| {
                let history = rt.block_on(store.load_stream(tenant_id, invoice_id.0)).unwrap();
                let mut invoice = Invoice::empty(invoice_id, rules.clone());
                rehydrate(&mut invoice, &history).unwrap();
                black_box(invoice.lines().len());
            });
        });
    }

    group.finish();
}

fn bench_append_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("append_throughput");

    for batch_size in [1usize, 10, 100, 1000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("append_batch", batch_size),
            &batch_size,
            |b, &batch_size| {
                let store = InMemoryEventStore::new();
                let tenant_id = TenantId::new();

                b.iter(|| {
                    // Fresh stream per iteration keeps replay cost out of the
                    // picture; this measures the append path alone.
                    let invoice_id = InvoiceId::new(AggregateId::new());
                    let batch = stream_batch(tenant_id, invoice_id, batch_size);
                    let stored = rt
                        .block_on(store.append(batch, ExpectedVersion::Exact(0)))
                        .unwrap();
                    black_box(stored.len());
                });
            },
        );
    }

    group.finish();
}

struct NullPublisher;

#[async_trait::async_trait]
impl EventPublisher for NullPublisher {
    async fn publish(&self, _envelope: EventEnvelope<JsonValue>) -> Result<(), PublishError> {
        Ok(())
    }
}

fn bench_outbox_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("outbox_drain");

    for pending in [32usize, 256] {
        group.throughput(Throughput::Elements(pending as u64));
        group.bench_with_input(
            BenchmarkId::new("drain_pending", pending),
            &pending,
            |b, &pending| {
                b.iter_batched(
                    || {
                        let store = Arc::new(InMemoryEventStore::new());
                        let tenant_id = TenantId::new();
                        rt.block_on(async {
                            // Spread entries across aggregates of ten events.
                            for _ in 0..pending.div_ceil(10) {
                                let invoice_id = InvoiceId::new(AggregateId::new());
                                let batch =
                                    stream_batch(tenant_id, invoice_id, pending.min(10));
                                store.append(batch, ExpectedVersion::Exact(0)).await.unwrap();
                            }
                        });
                        OutboxRelay::new(store, NullPublisher).with_config(RelayConfig {
                            batch_size: pending,
                            ..RelayConfig::default()
                        })
                    },
                    |relay| {
                        let report = rt.block_on(relay.drain_once()).unwrap();
                        black_box(report.published);
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_projection_rebuild(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("projection_rebuild");

    for events in [10usize, 100, 1000, 10_000] {
        group.throughput(Throughput::Elements(events as u64));
        group.bench_with_input(
            BenchmarkId::new("rebuild_from_envelopes", events),
            &events,
            |b, &events| {
                let store = InMemoryEventStore::new();
                let tenant_id = TenantId::new();
                // Streams of up to a thousand events each.
                let envelopes: Vec<EventEnvelope<JsonValue>> = rt.block_on(async {
                    let mut envelopes = Vec::with_capacity(events);
                    let mut remaining = events;
                    while remaining > 0 {
                        let depth = remaining.min(1000);
                        let invoice_id = InvoiceId::new(AggregateId::new());
                        let stored = store
                            .append(
                                stream_batch(tenant_id, invoice_id, depth),
                                ExpectedVersion::Exact(0),
                            )
                            .await
                            .unwrap();
                        envelopes.extend(stored.iter().map(|s| s.to_envelope()));
                        remaining -= depth;
                    }
                    envelopes
                });

                let projection = InvoicesProjection::new(Arc::new(InMemoryTenantStore::new()));
                b.iter(|| {
                    projection
                        .rebuild_from_scratch(black_box(envelopes.clone()))
                        .unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_dispatch,
    bench_rehydration,
    bench_append_throughput,
    bench_outbox_drain,
    bench_projection_rebuild
);
criterion_main!(benches);
