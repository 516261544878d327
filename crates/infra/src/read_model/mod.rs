//! Disposable, query-optimized product read model.
//!
//! Only the projector (or a rebuild) writes here; queries read from here only.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use shelf_products::{FieldChange, ProductId, ProductView};

pub use in_memory::InMemoryReadStore;
pub use postgres::PostgresReadStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadStoreError {
    #[error("read store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt read model data: {0}")]
    Corrupt(String),
}

/// Result of [`ReadStore::insert`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with this id was already present; nothing was written.
    AlreadyExists,
}

/// Storage for [`ProductView`] records.
#[async_trait]
pub trait ReadStore: Send + Sync {
    async fn get(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError>;

    /// Insert unless a record with the same id exists.
    async fn insert(&self, view: &ProductView) -> Result<InsertOutcome, ReadStoreError>;

    /// Apply field changes in one step to a record that is at `version - 1`
    /// and return the result. `None` if there is no such record or it holds
    /// another version.
    async fn find_and_modify(
        &self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<ProductView>, ReadStoreError>;

    /// Insert, or fully replace a record holding an older version. Returns
    /// whether anything was written.
    async fn upsert(&self, view: &ProductView) -> Result<bool, ReadStoreError>;

    /// Returns whether a record was removed.
    async fn remove(&self, id: ProductId) -> Result<bool, ReadStoreError>;

    /// Every record, ordered by id.
    async fn list(&self) -> Result<Vec<ProductView>, ReadStoreError>;

    /// Remove every record (rebuild support).
    async fn clear(&self) -> Result<(), ReadStoreError>;
}

#[async_trait]
impl<S> ReadStore for Arc<S>
where
    S: ReadStore + ?Sized,
{
    async fn get(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError> {
        (**self).get(id).await
    }

    async fn insert(&self, view: &ProductView) -> Result<InsertOutcome, ReadStoreError> {
        (**self).insert(view).await
    }

    async fn find_and_modify(
        &self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<ProductView>, ReadStoreError> {
        (**self).find_and_modify(id, changes, version, updated_at).await
    }

    async fn upsert(&self, view: &ProductView) -> Result<bool, ReadStoreError> {
        (**self).upsert(view).await
    }

    async fn remove(&self, id: ProductId) -> Result<bool, ReadStoreError> {
        (**self).remove(id).await
    }

    async fn list(&self) -> Result<Vec<ProductView>, ReadStoreError> {
        (**self).list().await
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        (**self).clear().await
    }
}
