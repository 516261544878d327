//! Store wrappers that inject latency and races into tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Barrier;

use shelf_core::{AggregateId, ExpectedVersion};
use shelf_products::{FieldChange, Product, ProductId, ProductView};

use crate::event_store::{
    EventStore, EventStoreError, InMemoryWriteStore, StoredEvent, UncommittedEvent, WriteStore,
    WriteTransaction,
};
use crate::projections::CheckpointStore;
use crate::read_model::{InsertOutcome, ReadStore, ReadStoreError};

/// A write store whose `begin` never completes.
pub(crate) struct HangingStore {
    inner: InMemoryWriteStore,
}

impl HangingStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryWriteStore::new(),
        }
    }

    pub(crate) fn inner(&self) -> &InMemoryWriteStore {
        &self.inner
    }
}

#[async_trait]
impl EventStore for HangingStore {
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_for(aggregate_id).await
    }

    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.all_events().await
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        EventStore::latest_version(&self.inner, aggregate_id).await
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        self.inner.stream_heads().await
    }

    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_after(aggregate_id, after).await
    }
}

#[async_trait]
impl WriteStore for HangingStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError> {
        std::future::pending().await
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        WriteStore::find_product(&self.inner, id).await
    }

    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        self.inner.list_products().await
    }
}

/// A write store whose transactions wait at a shared barrier before
/// committing, so `parties` concurrent commands reach commit together.
pub(crate) struct BarrierStore {
    inner: InMemoryWriteStore,
    barrier: Arc<Barrier>,
}

impl BarrierStore {
    pub(crate) fn new(inner: InMemoryWriteStore, parties: usize) -> Self {
        Self {
            inner,
            barrier: Arc::new(Barrier::new(parties)),
        }
    }
}

#[async_trait]
impl EventStore for BarrierStore {
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_for(aggregate_id).await
    }

    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.all_events().await
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        EventStore::latest_version(&self.inner, aggregate_id).await
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        self.inner.stream_heads().await
    }

    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_after(aggregate_id, after).await
    }
}

#[async_trait]
impl WriteStore for BarrierStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError> {
        Ok(Box::new(BarrierTransaction {
            inner: self.inner.begin().await?,
            barrier: self.barrier.clone(),
        }))
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        WriteStore::find_product(&self.inner, id).await
    }

    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        self.inner.list_products().await
    }
}

struct BarrierTransaction {
    inner: Box<dyn WriteTransaction>,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl WriteTransaction for BarrierTransaction {
    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        self.inner.find_product(id).await
    }

    async fn find_product_by_name(&mut self, name: &str) -> Result<Option<Product>, EventStoreError> {
        self.inner.find_product_by_name(name).await
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), EventStoreError> {
        self.inner.insert_product(product).await
    }

    async fn update_product(
        &mut self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Product>, EventStoreError> {
        self.inner.update_product(id, changes, version, updated_at).await
    }

    async fn delete_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        self.inner.delete_product(id).await
    }

    async fn latest_version(&mut self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        self.inner.latest_version(aggregate_id).await
    }

    async fn append(
        &mut self,
        event: UncommittedEvent,
        expected_version: ExpectedVersion,
    ) -> Result<StoredEvent, EventStoreError> {
        self.inner.append(event, expected_version).await
    }

    async fn commit(self: Box<Self>) -> Result<(), EventStoreError> {
        let this = *self;
        this.barrier.wait().await;
        this.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), EventStoreError> {
        self.inner.rollback().await
    }
}

/// A read store whose `find_and_modify` sleeps before touching the record.
pub(crate) struct SlowReads<R> {
    inner: R,
    delay: Duration,
}

impl<R> SlowReads<R> {
    pub(crate) fn new(inner: R, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<R: ReadStore> ReadStore for SlowReads<R> {
    async fn get(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError> {
        self.inner.get(id).await
    }

    async fn insert(&self, view: &ProductView) -> Result<InsertOutcome, ReadStoreError> {
        self.inner.insert(view).await
    }

    async fn find_and_modify(
        &self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<ProductView>, ReadStoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_and_modify(id, changes, version, updated_at).await
    }

    async fn upsert(&self, view: &ProductView) -> Result<bool, ReadStoreError> {
        self.inner.upsert(view).await
    }

    async fn remove(&self, id: ProductId) -> Result<bool, ReadStoreError> {
        self.inner.remove(id).await
    }

    async fn list(&self) -> Result<Vec<ProductView>, ReadStoreError> {
        self.inner.list().await
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        self.inner.clear().await
    }
}

/// A checkpoint store whose `set` sleeps before writing.
pub(crate) struct SlowCheckpoints<C> {
    inner: C,
    delay: Duration,
}

impl<C> SlowCheckpoints<C> {
    pub(crate) fn new(inner: C, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl<C: CheckpointStore> CheckpointStore for SlowCheckpoints<C> {
    async fn get(&self, aggregate_id: AggregateId) -> Result<u64, ReadStoreError> {
        self.inner.get(aggregate_id).await
    }

    async fn set(&self, aggregate_id: AggregateId, version: u64) -> Result<(), ReadStoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.set(aggregate_id, version).await
    }

    async fn all(&self) -> Result<HashMap<AggregateId, u64>, ReadStoreError> {
        self.inner.all().await
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        self.inner.clear().await
    }
}

/// A write store that refuses full event-log scans.
pub(crate) struct IndexedOnlyStore {
    inner: InMemoryWriteStore,
}

impl IndexedOnlyStore {
    pub(crate) fn new(inner: InMemoryWriteStore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventStore for IndexedOnlyStore {
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_for(aggregate_id).await
    }

    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        Err(EventStoreError::Unavailable("full log scan refused".to_string()))
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        EventStore::latest_version(&self.inner, aggregate_id).await
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        self.inner.stream_heads().await
    }

    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.inner.events_after(aggregate_id, after).await
    }
}

#[async_trait]
impl WriteStore for IndexedOnlyStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError> {
        self.inner.begin().await
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        WriteStore::find_product(&self.inner, id).await
    }

    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        self.inner.list_products().await
    }
}
