use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::Runtime;

use chronicle_core::{ExpectedVersion, StreamName};
use chronicle_events::{
    DecoratedEvent, Event, EventHandlers, EventListener, EventNormalizer, EventTypeRegistry,
    HandlerResult, RawEvent,
};
use chronicle_infra::applied_events::InMemoryAppliedEventsLog;
use chronicle_infra::event_store::{EventStore, InMemoryEventStorage};
use chronicle_infra::listeners::EventListenerInvoker;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StockAdjusted {
    sku: String,
    delta: i64,
}

impl Event for StockAdjusted {}

#[derive(Default)]
struct StockTotal {
    total: i64,
}

impl StockTotal {
    fn when_adjusted(&mut self, event: &StockAdjusted, _raw: &RawEvent) -> HandlerResult {
        self.total += event.delta;
        Ok(())
    }
}

impl EventListener for StockTotal {
    fn listener_id(&self) -> &str {
        "stock-total"
    }

    fn handlers() -> EventHandlers<Self> {
        EventHandlers::new().on(StockTotal::when_adjusted)
    }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn store() -> EventStore {
    let normalizer = EventNormalizer::new(
        EventTypeRegistry::new().register_as::<StockAdjusted>("inventory.stock_adjusted"),
    );
    EventStore::new("bench", Arc::new(InMemoryEventStorage::new()), normalizer)
}

fn adjustments(count: usize) -> Vec<DecoratedEvent> {
    (0..count)
        .map(|i| {
            DecoratedEvent::new(StockAdjusted {
                sku: "SKU-1".to_string(),
                delta: (i % 10) as i64,
            })
        })
        .collect()
}

fn stream() -> StreamName {
    StreamName::new("Inventory:SKU-1").unwrap()
}

fn bench_event_append_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("event_append_throughput");

    for batch_size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("batch_append", batch_size),
            batch_size,
            |b, &size| {
                let store = store();
                b.iter_batched(
                    || adjustments(size),
                    |events| {
                        black_box(
                            rt.block_on(store.append(&stream(), ExpectedVersion::Any, events))
                                .unwrap(),
                        )
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_catch_up_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("catch_up_throughput");

    for event_count in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::new("catch_up_from_start", event_count),
            event_count,
            |b, &count| {
                let store = store();
                rt.block_on(store.append(&stream(), ExpectedVersion::NoStream, adjustments(count)))
                    .unwrap();

                // Fresh log per iteration: every run starts from the first event.
                b.iter_batched(
                    || {
                        EventListenerInvoker::<StockTotal>::new(
                            store.clone(),
                            Arc::new(InMemoryAppliedEventsLog::new()),
                        )
                    },
                    |invoker| {
                        let mut listener = StockTotal::default();
                        let outcome = rt.block_on(invoker.catch_up(&mut listener)).unwrap();
                        black_box((outcome, listener.total))
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

fn bench_load_all(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("load_all");

    for event_count in [100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*event_count as u64));
        group.bench_with_input(
            BenchmarkId::new("denormalize_all", event_count),
            event_count,
            |b, &count| {
                let store = store();
                rt.block_on(store.append(&stream(), ExpectedVersion::NoStream, adjustments(count)))
                    .unwrap();

                b.iter(|| {
                    let envelopes = rt.block_on(store.load_all(1)).unwrap();
                    let total: i64 = envelopes
                        .map(|envelope| {
                            envelope
                                .unwrap()
                                .downcast_ref::<StockAdjusted>()
                                .map_or(0, |e| e.delta)
                        })
                        .sum();
                    black_box(total)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_append_throughput,
    bench_catch_up_throughput,
    bench_load_all
);
criterion_main!(benches);
