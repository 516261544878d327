use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use shelf_products::{FieldChange, ProductId, ProductView};

use super::{InsertOutcome, ReadStore, ReadStoreError};

/// In-memory read store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReadStore {
    inner: RwLock<BTreeMap<ProductId, ProductView>>,
}

impl InMemoryReadStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ReadStoreError {
        ReadStoreError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn get(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(&id).cloned())
    }

    async fn insert(&self, view: &ProductView) -> Result<InsertOutcome, ReadStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        if map.contains_key(&view.product_id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        map.insert(view.product_id, view.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn find_and_modify(
        &self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<ProductView>, ReadStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(match map.get_mut(&id) {
            Some(view) if view.version + 1 == version => {
                view.apply_changes(changes, version, updated_at);
                Some(view.clone())
            }
            _ => None,
        })
    }

    async fn upsert(&self, view: &ProductView) -> Result<bool, ReadStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        if map
            .get(&view.product_id)
            .is_some_and(|existing| existing.version >= view.version)
        {
            return Ok(false);
        }
        map.insert(view.product_id, view.clone());
        Ok(true)
    }

    async fn remove(&self, id: ProductId) -> Result<bool, ReadStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(map.remove(&id).is_some())
    }

    async fn list(&self) -> Result<Vec<ProductView>, ReadStoreError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map.values().cloned().collect())
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        self.inner.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}
