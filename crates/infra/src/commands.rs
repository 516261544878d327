//! Command execution pipeline (write side).
//!
//! Every command runs the same state machine:
//!
//! ```text
//! Validate
//!   ↓
//! BeginTransaction
//!   ↓
//! MutateAuthoritativeRecord
//!   ↓
//! AppendEvent          (version = latest_version + 1, same transaction)
//!   ↓
//! Commit
//!   ↓
//! EnqueueProjection    (non-blocking; failure is logged and counted)
//!   ↓
//! ReturnResult
//! ```
//!
//! Any failure before `Commit` drops the transaction, which rolls it back, so
//! an event never exists without its authoritative mutation or vice versa.
//! Every store call before `Commit` is bounded by `store_timeout`.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use shelf_core::{DomainError, ExpectedVersion};
use shelf_events::{EventBus, EventEnvelope};
use shelf_products::{
    NewProduct, Product, ProductCreated, ProductDeleted, ProductEvent, ProductId, ProductPatch,
    ProductUpdated,
};

use crate::event_store::{
    EventStoreError, StoredEvent, UncommittedEvent, WriteStore, WriteTransaction,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Input failed validation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("product not found")]
    NotFound,

    /// Lost a race on the stream version, or the product name is taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store failed or did not answer within the store timeout.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl CommandError {
    /// Whether re-running the same command may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Conflict(_) | CommandError::StoreUnavailable(_))
    }
}

impl From<DomainError> for CommandError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                CommandError::Validation(msg)
            }
            DomainError::NotFound => CommandError::NotFound,
            DomainError::Conflict(msg) => CommandError::Conflict(msg),
        }
    }
}

impl From<EventStoreError> for CommandError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Conflict(msg) => CommandError::Conflict(msg),
            EventStoreError::Unavailable(msg) => CommandError::StoreUnavailable(msg),
            EventStoreError::Corrupt(msg) => CommandError::Corrupt(msg),
        }
    }
}

/// Executes product commands against a [`WriteStore`] and hands committed
/// events to the projection queue `B`.
pub struct CommandProcessor<B> {
    store: Arc<dyn WriteStore>,
    bus: B,
    store_timeout: Duration,
    dispatch_failures: AtomicU64,
}

impl<B> CommandProcessor<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(store: Arc<dyn WriteStore>, bus: B, store_timeout: Duration) -> Self {
        Self {
            store,
            bus,
            store_timeout,
            dispatch_failures: AtomicU64::new(0),
        }
    }

    /// Committed events whose hand-off to the projector was rejected.
    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_product(&self, input: NewProduct) -> Result<Product, CommandError> {
        let details = input.validate()?;
        let mut tx = self.bounded("begin", self.store.begin()).await?;

        if self
            .bounded("find_product_by_name", tx.find_product_by_name(&details.name))
            .await?
            .is_some()
        {
            return Err(CommandError::Conflict(format!(
                "a product named '{}' already exists",
                details.name
            )));
        }

        let product_id = ProductId::generate();
        let latest = self
            .bounded("latest_version", tx.latest_version(product_id.aggregate_id()))
            .await?;
        let now = business_time();
        let product = Product {
            id: product_id,
            details,
            version: latest + 1,
            created_at: now,
            updated_at: now,
        };
        self.bounded("insert_product", tx.insert_product(&product))
            .await?;

        let event = ProductEvent::Created(ProductCreated {
            product_id,
            details: product.details.clone(),
            created_at: now,
        });
        let stored = self.append_and_commit(tx, &event, latest).await?;

        info!(product_id = %product_id, version = stored.version, "product created");
        self.dispatch(&stored);
        Ok(product)
    }

    #[instrument(skip(self, patch), fields(product_id = %id))]
    pub async fn update_product(
        &self,
        id: ProductId,
        patch: ProductPatch,
    ) -> Result<Product, CommandError> {
        let patch = patch.validate()?;
        let mut tx = self.bounded("begin", self.store.begin()).await?;

        let Some(current) = self.bounded("find_product", tx.find_product(id)).await? else {
            return Err(CommandError::NotFound);
        };

        if let Some(name) = patch.name.as_deref().filter(|n| *n != current.name()) {
            let taken = self
                .bounded("find_product_by_name", tx.find_product_by_name(name))
                .await?;
            if taken.is_some_and(|other| other.id != id) {
                return Err(CommandError::Conflict(format!(
                    "a product named '{name}' already exists"
                )));
            }
        }

        let latest = self
            .bounded("latest_version", tx.latest_version(id.aggregate_id()))
            .await?;
        let now = business_time();
        let changes = patch.changes();
        let updated = self
            .bounded(
                "update_product",
                tx.update_product(id, &changes, latest + 1, now),
            )
            .await?
            .ok_or(CommandError::NotFound)?;

        let event = ProductEvent::Updated(ProductUpdated {
            product_id: id,
            changes: patch,
            previous: current.details,
            created_at: current.created_at,
            updated_at: now,
        });
        let stored = self.append_and_commit(tx, &event, latest).await?;

        info!(product_id = %id, version = stored.version, "product updated");
        self.dispatch(&stored);
        Ok(updated)
    }

    /// Delete a product. Returns the removed record.
    #[instrument(skip(self), fields(product_id = %id))]
    pub async fn delete_product(&self, id: ProductId) -> Result<Product, CommandError> {
        let mut tx = self.bounded("begin", self.store.begin()).await?;

        if self
            .bounded("find_product", tx.find_product(id))
            .await?
            .is_none()
        {
            return Err(CommandError::NotFound);
        }

        let latest = self
            .bounded("latest_version", tx.latest_version(id.aggregate_id()))
            .await?;
        let removed = self
            .bounded("delete_product", tx.delete_product(id))
            .await?
            .ok_or(CommandError::NotFound)?;

        let event = ProductEvent::Deleted(ProductDeleted {
            product_id: id,
            name: removed.details.name.clone(),
            deleted_at: business_time(),
        });
        let stored = self.append_and_commit(tx, &event, latest).await?;

        info!(product_id = %id, version = stored.version, "product deleted");
        self.dispatch(&stored);
        Ok(removed)
    }

    async fn append_and_commit(
        &self,
        mut tx: Box<dyn WriteTransaction>,
        event: &ProductEvent,
        latest: u64,
    ) -> Result<StoredEvent, CommandError> {
        let uncommitted = UncommittedEvent::from_product_event(event)?;
        let stored = self
            .bounded(
                "append",
                tx.append(uncommitted, ExpectedVersion::Exact(latest)),
            )
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    fn dispatch(&self, stored: &StoredEvent) {
        match self.bus.publish(stored.to_envelope()) {
            Ok(()) => debug!(
                aggregate_id = %stored.aggregate_id,
                version = stored.version,
                "event handed to projection queue"
            ),
            Err(err) => {
                self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    aggregate_id = %stored.aggregate_id,
                    version = stored.version,
                    event_type = %stored.event_type,
                    error = %err,
                    "projection hand-off failed; the event stays in the log for catch-up"
                );
            }
        }
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, CommandError>
    where
        F: Future<Output = Result<T, EventStoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result.map_err(CommandError::from),
            Err(_) => {
                warn!(operation, timeout = ?self.store_timeout, "store call timed out");
                Err(CommandError::StoreUnavailable(format!(
                    "{operation} timed out after {:?}",
                    self.store_timeout
                )))
            }
        }
    }
}

/// Re-run `op` while it fails with `Conflict`, at most `max_attempts` times.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: u32, mut op: F) -> Result<T, CommandError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CommandError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(CommandError::Conflict(msg)) if attempt < max_attempts => {
                debug!(attempt, %msg, "retrying command after conflict");
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Current time at the precision Postgres stores, so event payloads and
/// stored records agree exactly.
fn business_time() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
