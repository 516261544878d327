//! Integration tests for the full synchronization pipeline.
//!
//! Tests: Command → WriteStore → ChannelBus → Projector → ReadStore
//!
//! Verifies:
//! - Event streams stay gap-free under arbitrary command sequences
//! - Rebuilds are idempotent and resync/replay converge
//! - The read model tolerates duplicate, missing and lost deliveries

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value as JsonValue;

use shelf_core::{AggregateId, EventId, ExpectedVersion};
use shelf_events::{ChannelBus, EventEnvelope, Subscription};
use shelf_products::{
    AGGREGATE_TYPE, NewProduct, ProductDetails, ProductEvent, ProductId, ProductPatch, ProductView, SkipReason,
};

use crate::commands::{CommandError, CommandProcessor, retry_on_conflict};
use crate::config::SyncConfig;
use crate::engine::{ProjectionBus, SyncEngine};
use crate::event_store::{EventStore, InMemoryWriteStore, UncommittedEvent, WriteStore};
use crate::projections::{
    CheckpointStore, InMemoryCheckpointStore, ProjectionOutcome, Projector, RebuildCoordinator,
};
use crate::read_model::{InMemoryReadStore, ReadStore};
use crate::testing::{BarrierStore, HangingStore};

struct Harness {
    store: InMemoryWriteStore,
    commands: CommandProcessor<ProjectionBus>,
    feed: Subscription<EventEnvelope<JsonValue>>,
    projector: Arc<Projector>,
    coordinator: RebuildCoordinator,
}

impl Harness {
    fn new() -> Self {
        Self::with_queue_capacity(256)
    }

    fn with_queue_capacity(capacity: usize) -> Self {
        let store = InMemoryWriteStore::new();
        let shared: Arc<dyn WriteStore> = Arc::new(store.clone());
        let (bus, feed) = ChannelBus::bounded(capacity);
        let projector = Arc::new(Projector::new(
            Arc::new(InMemoryReadStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        ));

        Self {
            commands: CommandProcessor::new(shared.clone(), bus, Duration::from_secs(5)),
            coordinator: RebuildCoordinator::new(shared, projector.clone()),
            store,
            feed,
            projector,
        }
    }

    /// Project everything currently queued, like the worker would.
    async fn pump(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(envelope) = self.feed.try_recv() {
            self.projector.project(&envelope).await.unwrap();
            delivered += 1;
        }
        delivered
    }

    async fn read_model(&self) -> Vec<ProductView> {
        let mut views = self.projector.reads().list().await.unwrap();
        views.sort_by_key(|v| v.product_id);
        views
    }

    async fn view(&self, id: ProductId) -> Option<ProductView> {
        self.projector.reads().get(id).await.unwrap()
    }

    async fn versions(&self, id: AggregateId) -> Vec<u64> {
        self.store
            .events_for(id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.version)
            .collect()
    }
}

fn new_product(name: &str, price: i64, stock: i64) -> NewProduct {
    NewProduct {
        name: name.to_string(),
        description: None,
        price,
        stock_quantity: Some(stock),
    }
}

fn price(p: i64) -> ProductPatch {
    ProductPatch {
        price: Some(p),
        ..Default::default()
    }
}

fn stock(s: i64) -> ProductPatch {
    ProductPatch {
        stock_quantity: Some(s),
        ..Default::default()
    }
}

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

#[tokio::test]
async fn widget_lifecycle_end_to_end() {
    let mut h = Harness::new();

    // Create
    let widget = h
        .commands
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap();
    h.pump().await;
    let view = h.view(widget.id).await.unwrap();
    assert_eq!((view.details.price, view.details.stock_quantity, view.version), (10, 5, 1));

    // Price change
    h.commands.update_product(widget.id, price(9)).await.unwrap();
    h.pump().await;
    let view = h.view(widget.id).await.unwrap();
    assert_eq!((view.details.price, view.details.stock_quantity, view.version), (9, 5, 2));

    // Stock change
    let last = h.commands.update_product(widget.id, stock(3)).await.unwrap();
    h.pump().await;
    let view = h.view(widget.id).await.unwrap();
    assert_eq!((view.details.price, view.details.stock_quantity, view.version), (9, 3, 3));
    assert_eq!(view.updated_at, last.updated_at);
    assert_eq!(view.created_at, widget.created_at);

    // Delete
    h.commands.delete_product(widget.id).await.unwrap();
    h.pump().await;
    assert!(h.view(widget.id).await.is_none());

    let events = h.store.events_for(widget.id.aggregate_id()).await.unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        vec![
            "products.product.created",
            "products.product.updated",
            "products.product.updated",
            "products.product.deleted",
        ]
    );
    assert_eq!(h.versions(widget.id.aggregate_id()).await, vec![1, 2, 3, 4]);

    match ProductEvent::decode(&events[1].event_type, &events[1].payload).unwrap() {
        ProductEvent::Updated(e) => {
            assert_eq!(e.previous.price, 10);
            assert_eq!(e.changes, price(9));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn replay_is_idempotent_and_matches_live_projection() {
    let mut h = Harness::new();
    let a = h.commands.create_product(new_product("Alpha", 1, 1)).await.unwrap();
    let b = h.commands.create_product(new_product("Bravo", 2, 2)).await.unwrap();
    h.commands.update_product(a.id, price(5)).await.unwrap();
    h.commands.delete_product(b.id).await.unwrap();
    h.pump().await;
    let live = h.read_model().await;

    let first = h.coordinator.replay().await.unwrap();
    let after_first = h.read_model().await;
    let second = h.coordinator.replay().await.unwrap();
    let after_second = h.read_model().await;

    assert_eq!(first, second);
    assert_eq!(first.count, 4);
    assert_eq!(first.skipped, 0);
    assert_eq!(after_first, live);
    assert_eq!(after_second, live);
}

#[tokio::test]
async fn resync_and_replay_converge() {
    let mut h = Harness::new();
    let a = h.commands.create_product(new_product("Alpha", 1, 1)).await.unwrap();
    let b = h.commands.create_product(new_product("Bravo", 2, 2)).await.unwrap();
    let c = h.commands.create_product(new_product("Charlie", 3, 3)).await.unwrap();
    h.commands.update_product(a.id, stock(7)).await.unwrap();
    h.commands
        .update_product(
            c.id,
            ProductPatch {
                name: Some("Charlie II".to_string()),
                description: Some("renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.commands.delete_product(b.id).await.unwrap();
    h.pump().await;

    let resync = h.coordinator.resync().await.unwrap();
    let from_records = h.read_model().await;
    h.coordinator.replay().await.unwrap();
    let from_events = h.read_model().await;

    assert_eq!(resync.count, 2);
    assert_eq!(from_records, from_events);
    assert_eq!(from_events.len(), 2);
    assert_eq!(
        h.projector.checkpoints().get(a.id.aggregate_id()).await.unwrap(),
        2
    );
}

#[tokio::test]
async fn redelivered_created_leaves_read_record_unchanged() {
    let mut h = Harness::new();
    let widget = h
        .commands
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap();
    h.pump().await;
    let before = h.view(widget.id).await;

    let created = h.store.events_for(widget.id.aggregate_id()).await.unwrap()[0].to_envelope();
    assert_eq!(
        h.projector.project(&created).await.unwrap(),
        ProjectionOutcome::Skipped(SkipReason::AlreadyApplied)
    );

    h.projector.checkpoints().clear().await.unwrap();
    assert_eq!(
        h.projector.project(&created).await.unwrap(),
        ProjectionOutcome::Skipped(SkipReason::DuplicateCreate)
    );
    assert_eq!(h.view(widget.id).await, before);
}

#[tokio::test]
async fn update_recreates_missing_read_record() {
    let mut h = Harness::new();
    let widget = h
        .commands
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap();
    h.pump().await;
    h.projector.reads().remove(widget.id).await.unwrap();

    let updated = h.commands.update_product(widget.id, price(9)).await.unwrap();
    h.pump().await;

    let view = h.view(widget.id).await.unwrap();
    assert_eq!(view, ProductView::from_product(&updated));
}

#[tokio::test]
async fn concurrent_updates_yield_one_conflict() {
    let inner = InMemoryWriteStore::new();
    let seed = CommandProcessor::new(
        Arc::new(inner.clone()),
        ChannelBus::bounded(8).0,
        Duration::from_secs(5),
    );
    let widget = seed
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap();

    let racing = CommandProcessor::new(
        Arc::new(BarrierStore::new(inner.clone(), 2)),
        ChannelBus::bounded(8).0,
        Duration::from_secs(5),
    );
    let (first, second) = tokio::join!(
        racing.update_product(widget.id, price(1)),
        racing.update_product(widget.id, price(2)),
    );

    let conflicts = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Err(CommandError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(first.is_ok() as u8 + second.is_ok() as u8, 1);

    let retried = retry_on_conflict(3, || seed.update_product(widget.id, price(3)))
        .await
        .unwrap();
    assert_eq!(retried.version, 3);
}

#[tokio::test]
async fn deleting_missing_product_is_not_found_without_event() {
    let h = Harness::new();
    let err = h.commands.delete_product(ProductId::generate()).await.unwrap_err();
    assert_eq!(err, CommandError::NotFound);
    assert!(h.store.all_events().await.unwrap().is_empty());
}

#[tokio::test]
async fn timed_out_command_leaves_no_partial_state() {
    let hanging = Arc::new(HangingStore::new());
    let config = SyncConfig {
        store_timeout_ms: 25,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::with_stores(
        &config,
        hanging.clone(),
        Arc::new(InMemoryReadStore::new()),
        Arc::new(InMemoryCheckpointStore::new()),
    );

    let err = engine
        .commands()
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::StoreUnavailable(_)));
    assert!(engine.list_all_events().await.unwrap().is_empty());
    assert!(hanging.inner().list_products().await.unwrap().is_empty());
    assert!(engine.find_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn lost_hand_off_is_repaired_by_catch_up() {
    let mut h = Harness::with_queue_capacity(1);
    let a = h.commands.create_product(new_product("Alpha", 1, 1)).await.unwrap();
    let b = h.commands.create_product(new_product("Bravo", 2, 2)).await.unwrap();
    assert_eq!(h.commands.dispatch_failures(), 1);

    assert_eq!(h.pump().await, 1);
    assert!(h.view(a.id).await.is_some());
    assert!(h.view(b.id).await.is_none());

    let report = h.coordinator.catch_up().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(h.view(b.id).await, Some(ProductView::from_product(&b)));

    let again = h.coordinator.catch_up().await.unwrap();
    assert_eq!(again.applied, 0);
}

#[tokio::test]
async fn replay_skips_unknown_event_types() {
    let mut h = Harness::new();
    let widget = h
        .commands
        .create_product(new_product("Widget", 10, 5))
        .await
        .unwrap();
    h.pump().await;

    // A newer producer appended a type this projector does not know.
    let mut tx = h.store.begin().await.unwrap();
    tx.append(
        UncommittedEvent {
            event_id: EventId::new(),
            aggregate_id: widget.id.aggregate_id(),
            aggregate_type: AGGREGATE_TYPE.to_string(),
            event_type: "products.product.archived".to_string(),
            created_at: widget.created_at,
            payload: serde_json::json!({}),
        },
        ExpectedVersion::Exact(1),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let report = h.coordinator.replay().await.unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.view(widget.id).await, Some(ProductView::from_product(&widget)));

    let caught_up = h.coordinator.catch_up().await.unwrap();
    assert_eq!(caught_up.skipped, 1);
    assert_eq!(caught_up.failed, 0);
}

// Property tests

const SLOTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Create(usize),
    Update {
        slot: usize,
        price: Option<i64>,
        stock: Option<i64>,
    },
    Delete(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SLOTS).prop_map(Op::Create),
        (
            0..SLOTS,
            proptest::option::of(0i64..1_000),
            proptest::option::of(0i64..100),
        )
            .prop_map(|(slot, price, stock)| Op::Update { slot, price, stock }),
        (0..SLOTS).prop_map(Op::Delete),
    ]
}

fn slot_name(slot: usize) -> String {
    format!("Product {slot}")
}

/// Expected state after folding commands by hand.
#[derive(Default)]
struct Reference {
    live: HashMap<usize, (ProductId, ProductDetails)>,
    ids: HashMap<usize, ProductId>,
}

impl Reference {
    fn id_for(&mut self, slot: usize) -> ProductId {
        *self.ids.entry(slot).or_insert_with(ProductId::generate)
    }
}

async fn run_ops(h: &mut Harness, ops: &[Op]) -> Reference {
    let mut reference = Reference::default();

    for op in ops {
        match op {
            Op::Create(slot) => {
                let result = h
                    .commands
                    .create_product(new_product(&slot_name(*slot), 10, 1))
                    .await;
                if reference.live.contains_key(slot) {
                    assert!(matches!(result, Err(CommandError::Conflict(_))));
                } else {
                    let product = result.unwrap();
                    reference.ids.insert(*slot, product.id);
                    reference.live.insert(*slot, (product.id, product.details));
                }
            }
            Op::Update { slot, price, stock } => {
                let id = reference.id_for(*slot);
                let patch = ProductPatch {
                    price: *price,
                    stock_quantity: *stock,
                    ..Default::default()
                };
                let result = h.commands.update_product(id, patch.clone()).await;
                match reference.live.get_mut(slot) {
                    _ if patch.is_empty() => {
                        assert!(matches!(result, Err(CommandError::Validation(_))))
                    }
                    Some((_, details)) => {
                        patch.apply_to(details);
                        assert_eq!(&result.unwrap().details, details);
                    }
                    None => assert_eq!(result.unwrap_err(), CommandError::NotFound),
                }
            }
            Op::Delete(slot) => {
                let id = reference.id_for(*slot);
                let result = h.commands.delete_product(id).await;
                if reference.live.remove(slot).is_some() {
                    assert_eq!(result.unwrap().id, id);
                } else {
                    assert_eq!(result.unwrap_err(), CommandError::NotFound);
                }
            }
        }
    }

    reference
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn stream_versions_are_gap_free(updates in 0usize..20, delete in any::<bool>()) {
        block_on(async {
            let h = Harness::new();
            let product = h.commands.create_product(new_product("Widget", 10, 5)).await.unwrap();
            for i in 0..updates {
                h.commands.update_product(product.id, price(i as i64)).await.unwrap();
            }
            if delete {
                h.commands.delete_product(product.id).await.unwrap();
            }

            let expected: Vec<u64> = (1..=(1 + updates as u64 + delete as u64)).collect();
            assert_eq!(h.versions(product.id.aggregate_id()).await, expected);
        });
    }

    #[test]
    fn interleaved_commands_match_reference_fold(ops in proptest::collection::vec(op(), 100)) {
        block_on(async {
            let mut h = Harness::new();
            let reference = run_ops(&mut h, &ops).await;
            h.pump().await;

            let live = h.read_model().await;
            prop_assert_eq!(live.len(), reference.live.len());
            for (id, details) in reference.live.values() {
                let view = h.view(*id).await.unwrap();
                prop_assert_eq!(&view.details, details);
            }

            for id in reference.ids.values() {
                let versions = h.versions(id.aggregate_id()).await;
                let expected: Vec<u64> = (1..=versions.len() as u64).collect();
                prop_assert_eq!(versions, expected);
            }

            h.coordinator.replay().await.unwrap();
            prop_assert_eq!(h.read_model().await, live.clone());
            h.coordinator.resync().await.unwrap();
            prop_assert_eq!(h.read_model().await, live);
            Ok(())
        })?;
    }
}
