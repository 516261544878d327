//! Postgres-backed product read model (`product_reads` table).
//!
//! The read model may live in a different database than the write side
//! (`READ_DATABASE_URL`); nothing here assumes otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use shelf_core::AggregateId;
use shelf_products::{FieldChange, ProductDetails, ProductId, ProductView};

use super::{InsertOutcome, ReadStore, ReadStoreError};
use crate::db::is_decode_error;

const VIEW_COLUMNS: &str =
    "product_id, name, description, price, stock_quantity, version, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresReadStore {
    pool: PgPool,
}

impl PostgresReadStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadStore for PostgresReadStore {
    async fn get(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {VIEW_COLUMNS} FROM product_reads WHERE product_id = $1"
        ))
        .bind(*id.0.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_product_read", e))?;
        row.as_ref().map(view_from_row).transpose()
    }

    #[instrument(skip(self, view), fields(product_id = %view.product_id, version = view.version), err)]
    async fn insert(&self, view: &ProductView) -> Result<InsertOutcome, ReadStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_reads (
                product_id,
                name,
                description,
                price,
                stock_quantity,
                version,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (product_id) DO NOTHING
            "#,
        )
        .bind(*view.product_id.0.as_uuid())
        .bind(&view.details.name)
        .bind(&view.details.description)
        .bind(view.details.price)
        .bind(view.details.stock_quantity)
        .bind(view.version as i64)
        .bind(view.created_at)
        .bind(view.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_product_read", e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::AlreadyExists
        } else {
            InsertOutcome::Inserted
        })
    }

    #[instrument(skip(self, changes), fields(product_id = %id), err)]
    async fn find_and_modify(
        &self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<ProductView>, ReadStoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE product_reads SET ");
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
        qb.push(" WHERE product_id = ")
            .push_bind(*id.0.as_uuid())
            .push(" AND version = ")
            .push_bind(version as i64 - 1)
            .push(format!(" RETURNING {VIEW_COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("modify_product_read", e))?;
        row.as_ref().map(view_from_row).transpose()
    }

    async fn upsert(&self, view: &ProductView) -> Result<bool, ReadStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_reads (
                product_id,
                name,
                description,
                price,
                stock_quantity,
                version,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (product_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                stock_quantity = EXCLUDED.stock_quantity,
                version = EXCLUDED.version,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            WHERE product_reads.version < EXCLUDED.version
            "#,
        )
        .bind(*view.product_id.0.as_uuid())
        .bind(&view.details.name)
        .bind(&view.details.description)
        .bind(view.details.price)
        .bind(view.details.stock_quantity)
        .bind(view.version as i64)
        .bind(view.created_at)
        .bind(view.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_product_read", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: ProductId) -> Result<bool, ReadStoreError> {
        let result = sqlx::query("DELETE FROM product_reads WHERE product_id = $1")
            .bind(*id.0.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_product_read", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<ProductView>, ReadStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {VIEW_COLUMNS} FROM product_reads ORDER BY product_id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_product_reads", e))?;
        rows.iter().map(view_from_row).collect()
    }

    async fn clear(&self) -> Result<(), ReadStoreError> {
        sqlx::query("DELETE FROM product_reads")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear_product_reads", e))?;
        Ok(())
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ReadStoreError {
    if is_decode_error(&err) {
        ReadStoreError::Corrupt(format!("failed to decode row in {operation}: {err}"))
    } else {
        ReadStoreError::Unavailable(format!("sqlx error in {operation}: {err}"))
    }
}

fn view_from_row(row: &PgRow) -> Result<ProductView, ReadStoreError> {
    let map = |e: sqlx::Error| ReadStoreError::Corrupt(format!("failed to read product_reads row: {e}"));
    Ok(ProductView {
        product_id: ProductId::new(AggregateId::from_uuid(
            row.try_get("product_id").map_err(map)?,
        )),
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
