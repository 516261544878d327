//! Projection checkpoint persistence.
//!
//! A checkpoint is the highest event version applied to the read model for
//! one aggregate. It enables:
//! - Idempotent projection (deliveries at or below the checkpoint are ignored)
//! - Tombstones (the checkpoint outlives a deleted read record)
//! - Catch-up after a lost hand-off (events above the checkpoint are re-applied)
//! - Deterministic rebuilds (clear checkpoints and start over)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use shelf_core::AggregateId;

use crate::read_model::ReadStoreError;
use crate::read_model::postgres::map_sqlx_error;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last applied version for the aggregate, 0 if none.
    async fn get(&self, aggregate_id: AggregateId) -> Result<u64, ReadStoreError>;

    /// Raise the checkpoint to `version`. A lower version leaves it unchanged.
    async fn set(&self, aggregate_id: AggregateId, version: u64) -> Result<(), ReadStoreError>;

    /// Every checkpoint (catch-up support).
    async fn all(&self) -> Result<HashMap<AggregateId, u64>, ReadStoreError>;

    /// Drop all checkpoints (rebuild support).
    async fn clear(&self) -> Result<(), ReadStoreError>;
}

#[async_trait]
impl<S> CheckpointStore for Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get(&self, aggregate_id: AggregateId) -> Result<u64, ReadStoreError> {
        (**self).get(aggregate_id).await
    }

    async fn set(&self, aggregate_id: AggregateId, version: u64) -> Result<(), ReadStoreError> {
        (**self).set(aggregate_id, version).await
    }

    async fn all(&self) -> Result<HashMap<AggregateId, u64>, ReadStoreError> {
        (**self).all().await
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        (**self).clear().await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<AggregateId, u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> ReadStoreError {
        ReadStoreError::Unavailable("lock poisoned".to_string())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, aggregate_id: AggregateId) -> Result<u64, ReadStoreError> {
        let map = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(map.get(&aggregate_id).copied().unwrap_or(0))
    }

    async fn set(&self, aggregate_id: AggregateId, version: u64) -> Result<(), ReadStoreError> {
        let mut map = self.inner.write().map_err(|_| Self::poisoned())?;
        let checkpoint = map.entry(aggregate_id).or_insert(0);
        *checkpoint = (*checkpoint).max(version);
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<AggregateId, u64>, ReadStoreError> {
        Ok(self.inner.read().map_err(|_| Self::poisoned())?.clone())
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        self.inner.write().map_err(|_| Self::poisoned())?.clear();
        Ok(())
    }
}

/// Postgres-backed checkpoint store (`projection_checkpoints` table).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn get(&self, aggregate_id: AggregateId) -> Result<u64, ReadStoreError> {
        let row = sqlx::query(
            r#"
            SELECT version
            FROM projection_checkpoints
            WHERE aggregate_id = $1
            "#,
        )
        .bind(*aggregate_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_checkpoint", e))?;

        match row {
            Some(row) => {
                let v: i64 = row
                    .try_get("version")
                    .map_err(|e| ReadStoreError::Corrupt(format!("failed to read checkpoint: {e}")))?;
                Ok(v as u64)
            }
            None => Ok(0),
        }
    }

    async fn set(&self, aggregate_id: AggregateId, version: u64) -> Result<(), ReadStoreError> {
        sqlx::query(
            r#"
            INSERT INTO projection_checkpoints (
                aggregate_id,
                version
            )
            VALUES ($1, $2)
            ON CONFLICT (aggregate_id)
            DO UPDATE SET
                version = GREATEST(projection_checkpoints.version, EXCLUDED.version),
                updated_at = NOW()
            "#,
        )
        .bind(*aggregate_id.as_uuid())
        .bind(version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_checkpoint", e))?;
        Ok(())
    }

    async fn all(&self) -> Result<HashMap<AggregateId, u64>, ReadStoreError> {
        let rows = sqlx::query("SELECT aggregate_id, version FROM projection_checkpoints")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_checkpoints", e))?;

        rows.iter()
            .map(|row| {
                let id: uuid::Uuid = row.try_get("aggregate_id")?;
                let version: i64 = row.try_get("version")?;
                Ok((AggregateId::from_uuid(id), version as u64))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| ReadStoreError::Corrupt(format!("failed to read checkpoint row: {e}")))
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        sqlx::query("DELETE FROM projection_checkpoints")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_checkpoints", e))?;
        Ok(())
    }
}
