use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use shelf_events::{ChannelBus, EventEnvelope, Subscription};
use shelf_infra::commands::CommandProcessor;
use shelf_infra::engine::ProjectionBus;
use shelf_infra::event_store::{EventStore, InMemoryWriteStore, WriteStore};
use shelf_infra::projections::{InMemoryCheckpointStore, Projector, RebuildCoordinator};
use shelf_infra::read_model::InMemoryReadStore;
use shelf_products::{NewProduct, ProductPatch};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn product(n: usize) -> NewProduct {
    NewProduct {
        name: format!("Product {n:06}"),
        description: Some("benchmark fixture".to_string()),
        price: 1_000,
        stock_quantity: Some(10),
    }
}

struct Setup {
    store: InMemoryWriteStore,
    commands: CommandProcessor<ProjectionBus>,
    feed: Subscription<EventEnvelope<JsonValue>>,
    projector: Arc<Projector>,
    coordinator: RebuildCoordinator,
}

fn setup(queue_capacity: usize) -> Setup {
    let store = InMemoryWriteStore::new();
    let shared: Arc<dyn WriteStore> = Arc::new(store.clone());
    let (bus, feed) = ChannelBus::bounded(queue_capacity);
    let projector = Arc::new(Projector::new(
        Arc::new(InMemoryReadStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
    ));
    Setup {
        commands: CommandProcessor::new(shared.clone(), bus, Duration::from_secs(5)),
        coordinator: RebuildCoordinator::new(shared, projector.clone()),
        store,
        feed,
        projector,
    }
}

/// Fill the store with `products` products, each updated `updates` times.
fn seeded(rt: &Runtime, products: usize, updates: usize) -> Setup {
    let setup = setup(1);
    rt.block_on(async {
        for n in 0..products {
            let created = setup.commands.create_product(product(n)).await.expect("create");
            for u in 0..updates {
                let patch = ProductPatch {
                    stock_quantity: Some(u as i64),
                    ..Default::default()
                };
                setup
                    .commands
                    .update_product(created.id, patch)
                    .await
                    .expect("update");
            }
        }
    });
    setup
}

fn bench_command_execution_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("command_execution_latency");

    group.bench_function("create_product", |b| {
        let mut s = setup(1);
        let mut n = 0usize;
        b.iter(|| {
            n += 1;
            let created = rt
                .block_on(s.commands.create_product(product(n)))
                .expect("create");
            while s.feed.try_recv().is_some() {}
            black_box(created);
        });
    });

    group.bench_function("update_product", |b| {
        let mut s = setup(1);
        let created = rt
            .block_on(s.commands.create_product(product(0)))
            .expect("create");
        let mut price = 0i64;
        b.iter(|| {
            price += 1;
            let patch = ProductPatch {
                price: Some(price),
                ..Default::default()
            };
            let updated = rt
                .block_on(s.commands.update_product(created.id, patch))
                .expect("update");
            while s.feed.try_recv().is_some() {}
            black_box(updated);
        });
    });

    group.finish();
}

fn bench_projection_apply(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("projection_apply");

    for event_count in [100usize, 1_000].iter() {
        let s = seeded(&rt, *event_count / 4, 3);
        let events: Vec<_> = rt
            .block_on(s.store.all_events())
            .expect("events")
            .iter()
            .map(|e| e.to_envelope())
            .collect();

        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("project_fresh_read_model", event_count),
            &events,
            |b, events| {
                b.iter(|| {
                    let projector = Projector::new(
                        Arc::new(InMemoryReadStore::new()),
                        Arc::new(InMemoryCheckpointStore::new()),
                    );
                    rt.block_on(async {
                        for envelope in events {
                            black_box(projector.project(envelope).await.expect("project"));
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

fn bench_rebuild_speed(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rebuild_speed");
    group.sample_size(20);

    for product_count in [100usize, 1_000].iter() {
        let s = seeded(&rt, *product_count, 2);

        group.bench_with_input(
            BenchmarkId::new("replay", product_count),
            product_count,
            |b, _| b.iter(|| black_box(rt.block_on(s.coordinator.replay()).expect("replay"))),
        );
        group.bench_with_input(
            BenchmarkId::new("resync", product_count),
            product_count,
            |b, _| b.iter(|| black_box(rt.block_on(s.coordinator.resync()).expect("resync"))),
        );
        black_box(s.projector.reads());
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_command_execution_latency,
    bench_projection_apply,
    bench_rebuild_speed
);
criterion_main!(benches);
