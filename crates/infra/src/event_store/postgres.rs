//! Postgres-backed authoritative store + event log.
//!
//! Both tables live in one database so a command's record mutation and its
//! event share a single SQL transaction.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Concurrent append at the same version, or a taken product name |
//! | Decode / ColumnDecode | N/A | `Corrupt` | A stored row does not match the expected shape |
//! | Anything else | Any other | `Unavailable` | Network errors, pool closed, statement timeout, etc. |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, instrument};

use shelf_core::{AggregateId, EventId, ExpectedVersion};
use shelf_products::{FieldChange, Product, ProductDetails, ProductId};

use super::r#trait::{
    EventStore, EventStoreError, StoredEvent, UncommittedEvent, WriteStore, WriteTransaction,
    next_version,
};
use crate::db::{is_decode_error, is_unique_violation};

const EVENT_COLUMNS: &str =
    "event_id, aggregate_id, aggregate_type, version, event_type, payload, created_at";
const PRODUCT_COLUMNS: &str =
    "id, name, description, price, stock_quantity, version, created_at, updated_at";

/// Postgres-backed [`WriteStore`].
#[derive(Debug, Clone)]
pub struct PostgresWriteStore {
    pool: PgPool,
}

impl PostgresWriteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PostgresWriteStore {
    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 ORDER BY version ASC, created_at ASC"
        ))
        .bind(*aggregate_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_for", e))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at ASC, aggregate_id ASC, version ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("all_events", e))?;

        debug!(event_count = rows.len(), "loaded event log");
        rows.iter().map(event_from_row).collect()
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS current_version FROM events WHERE aggregate_id = $1")
            .bind(*aggregate_id.as_uuid())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_version", e))?;
        read_version(&row)
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT aggregate_id, MAX(version) AS current_version FROM events GROUP BY aggregate_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stream_heads", e))?;

        rows.iter()
            .map(|row| {
                let id: uuid::Uuid = row.try_get("aggregate_id").map_err(|e| corrupt("aggregate_id", e))?;
                Ok((AggregateId::from_uuid(id), read_version(row)?))
            })
            .collect()
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id), err)]
    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE aggregate_id = $1 AND version > $2 ORDER BY version ASC"
        ))
        .bind(*aggregate_id.as_uuid())
        .bind(after as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_after", e))?;

        rows.iter().map(event_from_row).collect()
    }
}

#[async_trait]
impl WriteStore for PostgresWriteStore {
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1"))
            .bind(*id.0.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        let rows = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_products", e))?;
        rows.iter().map(product_from_row).collect()
    }
}

/// An open SQL transaction. Dropping it rolls back.
struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl WriteTransaction for PostgresTransaction {
    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        // Row lock: a concurrent command on the same product waits for us.
        let row = sqlx::query(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE id = $1 FOR UPDATE"
        ))
        .bind(*id.0.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("find_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn find_product_by_name(&mut self, name: &str) -> Result<Option<Product>, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE name = $1"))
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("find_product_by_name", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self, product), fields(product_id = %product.id), err)]
    async fn insert_product(&mut self, product: &Product) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (
                id,
                name,
                description,
                price,
                stock_quantity,
                version,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*product.id.0.as_uuid())
        .bind(&product.details.name)
        .bind(&product.details.description)
        .bind(product.details.price)
        .bind(product.details.stock_quantity)
        .bind(product.version as i64)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Conflict(format!(
                    "a product named '{}' already exists",
                    product.details.name
                ))
            } else {
                map_sqlx_error("insert_product", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, changes), fields(product_id = %id), err)]
    async fn update_product(
        &mut self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Product>, EventStoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE products SET ");
        {
            let mut set = qb.separated(", ");
            for change in changes {
                set.push(format!("{} = ", change.field().column()));
                match change {
                    FieldChange::Name(v) | FieldChange::Description(v) => {
                        set.push_bind_unseparated(v.clone());
                    }
                    FieldChange::Price(v) | FieldChange::StockQuantity(v) => {
                        set.push_bind_unseparated(*v);
                    }
                }
            }
            set.push("version = ").push_bind_unseparated(version as i64);
            set.push("updated_at = ").push_bind_unseparated(updated_at);
        }
        qb.push(" WHERE id = ")
            .push_bind(*id.0.as_uuid())
            .push(format!(" RETURNING {PRODUCT_COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Conflict("product name already taken".to_string())
                } else {
                    map_sqlx_error("update_product", e)
                }
            })?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn delete_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError> {
        let row = sqlx::query(&format!(
            "DELETE FROM products WHERE id = $1 RETURNING {PRODUCT_COLUMNS}"
        ))
        .bind(*id.0.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_product", e))?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn latest_version(&mut self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS current_version FROM events WHERE aggregate_id = $1")
            .bind(*aggregate_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("latest_version", e))?;
        read_version(&row)
    }

    #[instrument(
        skip(self, event),
        fields(
            aggregate_id = %event.aggregate_id,
            event_type = %event.event_type,
            expected_version = ?expected_version
        ),
        err
    )]
    async fn append(
        &mut self,
        event: UncommittedEvent,
        expected_version: ExpectedVersion,
    ) -> Result<StoredEvent, EventStoreError> {
        let current = self.latest_version(event.aggregate_id).await?;
        let version = next_version(event.aggregate_id, expected_version, current)?;

        sqlx::query(
            r#"
            INSERT INTO events (
                event_id,
                aggregate_id,
                aggregate_type,
                version,
                event_type,
                payload,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*event.event_id.as_uuid())
        .bind(*event.aggregate_id.as_uuid())
        .bind(&event.aggregate_type)
        .bind(version as i64)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            // Another transaction committed this version first.
            if is_unique_violation(&e) {
                EventStoreError::Conflict(format!(
                    "concurrent append detected: version {version} already exists"
                ))
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        Ok(event.into_stored(version))
    }

    async fn commit(self: Box<Self>) -> Result<(), EventStoreError> {
        self.tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Conflict(format!("commit rejected: {e}"))
            } else {
                map_sqlx_error("commit_transaction", e)
            }
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), EventStoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    if is_unique_violation(&err) {
        return EventStoreError::Conflict(format!("unique violation in {operation}: {err}"));
    }
    if is_decode_error(&err) {
        return EventStoreError::Corrupt(format!("failed to decode row in {operation}: {err}"));
    }
    EventStoreError::Unavailable(format!("sqlx error in {operation}: {err}"))
}

fn corrupt(what: &str, err: sqlx::Error) -> EventStoreError {
    EventStoreError::Corrupt(format!("failed to read {what}: {err}"))
}

fn read_version(row: &PgRow) -> Result<u64, EventStoreError> {
    let v: i64 = row
        .try_get("current_version")
        .map_err(|e| corrupt("current_version", e))?;
    Ok(v as u64)
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, EventStoreError> {
    let map = |e| corrupt("event row", e);
    Ok(StoredEvent {
        event_id: EventId::from_uuid(row.try_get("event_id").map_err(map)?),
        aggregate_id: AggregateId::from_uuid(row.try_get("aggregate_id").map_err(map)?),
        aggregate_type: row.try_get("aggregate_type").map_err(map)?,
        version: row.try_get::<i64, _>("version").map_err(map)? as u64,
        event_type: row.try_get("event_type").map_err(map)?,
        payload: row.try_get("payload").map_err(map)?,
        created_at: row.try_get("created_at").map_err(map)?,
    })
}

fn product_from_row(row: &PgRow) -> Result<Product, EventStoreError> {
    let map = |e| corrupt("product row", e);
    Ok(Product {
        id: ProductId::new(AggregateId::from_uuid(row.try_get("id").map_err(map)?)),
        details: ProductDetails {
            name: row.try_get("name").map_err(map)?,
            description: row.try_get("description").map_err(map)?,
            price: row.try_get("price").map_err(map)?,
            stock_quantity: row.try_get("stock_quantity").map_err(map)?,
        },
        version: row.try_get::<i64, _>("version").map_err(map)? as u64,
        created_at: row.try_get("created_at").map_err(map)?,
        updated_at: row.try_get("updated_at").map_err(map)?,
    })
}
