use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shelf_core::{AggregateId, ExpectedVersion};
use shelf_products::{FieldChange, Product, ProductId};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, UncommittedEvent, WriteStore, WriteTransaction,
    next_version,
};

#[derive(Debug, Default)]
struct State {
    products: BTreeMap<ProductId, Product>,
    streams: HashMap<AggregateId, Vec<StoredEvent>>,
}

impl State {
    fn current_version(&self, aggregate_id: AggregateId) -> u64 {
        self.streams
            .get(&aggregate_id)
            .and_then(|s| s.last())
            .map(|e| e.version)
            .unwrap_or(0)
    }
}

/// In-memory authoritative store + event log.
///
/// Intended for tests/dev. Transactions stage their writes privately and
/// validate version and name uniqueness again when they commit, so two
/// transactions racing on one aggregate behave like the Postgres backend:
/// the later commit fails with `Conflict`.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWriteStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryWriteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryWriteStore {
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        Ok(state.streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        let mut events: Vec<StoredEvent> = state.streams.values().flatten().cloned().collect();
        events.sort_by(StoredEvent::replay_order);
        Ok(events)
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        Ok(self.read()?.current_version(aggregate_id))
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .keys()
            .map(|id| (*id, state.current_version(*id)))
            .collect())
    }

    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let state = self.read()?;
        Ok(state
            .streams
            .get(&aggregate_id)
            .map(|stream| stream.iter().filter(|e| e.version > after).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl WriteStore for InMemoryWriteStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError> {
        Ok(Box::new(InMemoryTransaction {
            state: self.state.clone(),
            staged_products: BTreeMap::new(),
            staged_events: Vec::new(),
        }))
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        Ok(self.read()?.products.get(&id).cloned())
    }

    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        Ok(self.read()?.products.values().cloned().collect())
    }
}

/// Staged writes of one in-memory transaction.
///
/// `staged_products` maps to `None` for a staged delete.
#[derive(Debug)]
struct InMemoryTransaction {
    state: Arc<RwLock<State>>,
    staged_products: BTreeMap<ProductId, Option<Product>>,
    staged_events: Vec<StoredEvent>,
}

impl InMemoryTransaction {
    fn committed(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))
    }

    fn visible_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        if let Some(staged) = self.staged_products.get(&id) {
            return Ok(staged.clone());
        }
        Ok(self.committed()?.products.get(&id).cloned())
    }

    fn name_taken_by_other(
        products: &BTreeMap<ProductId, Product>,
        staged: &BTreeMap<ProductId, Option<Product>>,
        id: ProductId,
        name: &str,
    ) -> bool {
        let committed_clash = products.values().any(|p| {
            p.id != id && p.name() == name && !staged.contains_key(&p.id)
        });
        let staged_clash = staged
            .values()
            .flatten()
            .any(|p| p.id != id && p.name() == name);
        committed_clash || staged_clash
    }

    fn check_name(&self, id: ProductId, name: &str) -> Result<(), EventStoreError> {
        let state = self.committed()?;
        if Self::name_taken_by_other(&state.products, &self.staged_products, id, name) {
            return Err(EventStoreError::Conflict(format!(
                "a product named '{name}' already exists"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WriteTransaction for InMemoryTransaction {
    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        self.visible_product(id)
    }

    async fn find_product_by_name(&mut self, name: &str) -> Result<Option<Product>, EventStoreError> {
        if let Some(p) = self.staged_products.values().flatten().find(|p| p.name() == name) {
            return Ok(Some(p.clone()));
        }
        let state = self.committed()?;
        Ok(state
            .products
            .values()
            .find(|p| p.name() == name && !self.staged_products.contains_key(&p.id))
            .cloned())
    }

    async fn insert_product(&mut self, product: &Product) -> Result<(), EventStoreError> {
        if self.visible_product(product.id)?.is_some() {
            return Err(EventStoreError::Conflict(format!(
                "product {} already exists",
                product.id
            )));
        }
        self.check_name(product.id, product.name())?;
        self.staged_products.insert(product.id, Some(product.clone()));
        Ok(())
    }

    async fn update_product(
        &mut self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Product>, EventStoreError> {
        let Some(mut product) = self.visible_product(id)? else {
            return Ok(None);
        };
        for change in changes {
            change.apply(&mut product.details);
        }
        product.version = version;
        product.updated_at = updated_at;

        self.check_name(id, product.name())?;
        self.staged_products.insert(id, Some(product.clone()));
        Ok(Some(product))
    }

    async fn delete_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        let existing = self.visible_product(id)?;
        if existing.is_some() {
            self.staged_products.insert(id, None);
        }
        Ok(existing)
    }

    async fn latest_version(&mut self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        let staged = self
            .staged_events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.version)
            .max();
        match staged {
            Some(v) => Ok(v),
            None => Ok(self.committed()?.current_version(aggregate_id)),
        }
    }

    async fn append(
        &mut self,
        event: UncommittedEvent,
        expected_version: ExpectedVersion,
    ) -> Result<StoredEvent, EventStoreError> {
        let current = self.latest_version(event.aggregate_id).await?;
        let version = next_version(event.aggregate_id, expected_version, current)?;
        let stored = event.into_stored(version);
        self.staged_events.push(stored.clone());
        Ok(stored)
    }

    async fn commit(self: Box<Self>) -> Result<(), EventStoreError> {
        let this = *self;
        let mut state = this
            .state
            .write()
            .map_err(|_| EventStoreError::Unavailable("lock poisoned".to_string()))?;

        // Re-validate against everything committed since this transaction began.
        for event in &this.staged_events {
            let committed = state.current_version(event.aggregate_id);
            let staged_before = this
                .staged_events
                .iter()
                .filter(|e| e.aggregate_id == event.aggregate_id && e.version < event.version)
                .count() as u64;
            if committed + staged_before + 1 != event.version {
                return Err(EventStoreError::Conflict(format!(
                    "version {} of stream {} is already taken",
                    event.version, event.aggregate_id
                )));
            }
        }
        for (id, staged) in &this.staged_products {
            if let Some(product) = staged {
                if InMemoryTransaction::name_taken_by_other(
                    &state.products,
                    &this.staged_products,
                    *id,
                    product.name(),
                ) {
                    return Err(EventStoreError::Conflict(format!(
                        "a product named '{}' already exists",
                        product.name()
                    )));
                }
            }
        }

        for (id, staged) in this.staged_products {
            match staged {
                Some(product) => {
                    state.products.insert(id, product);
                }
                None => {
                    state.products.remove(&id);
                }
            }
        }
        for event in this.staged_events {
            state.streams.entry(event.aggregate_id).or_default().push(event);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EventStoreError> {
        Ok(())
    }
}
