use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use shelf_core::{AggregateId, EventId, ExpectedVersion};
use shelf_events::{Event, EventEnvelope};
use shelf_products::{AGGREGATE_TYPE, FieldChange, Product, ProductEvent, ProductId};

/// An event ready to be appended to a stream (no version assigned yet).
///
/// `created_at` is the business time of the command that produced it, so a
/// replay of the log reproduces the same timestamps the authoritative store
/// holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl UncommittedEvent {
    pub fn from_product_event(event: &ProductEvent) -> Result<Self, EventStoreError> {
        let payload = event
            .to_payload()
            .map_err(|e| EventStoreError::Corrupt(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: EventId::new(),
            aggregate_id: event.aggregate_id(),
            aggregate_type: AGGREGATE_TYPE.to_string(),
            event_type: event.event_type().to_string(),
            created_at: event.occurred_at(),
            payload,
        })
    }

    pub(crate) fn into_stored(self, version: u64) -> StoredEvent {
        StoredEvent {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            version,
            event_type: self.event_type,
            created_at: self.created_at,
            payload: self.payload,
        }
    }
}

/// A committed event in an aggregate stream.
///
/// Versions are per aggregate, start at 1, and are gap-free. Events are
/// immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Position in the aggregate stream.
    pub version: u64,

    pub event_type: String,
    pub created_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl StoredEvent {
    /// Convert into the envelope handed to the projector.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.event_type.clone(),
            self.version,
            self.created_at,
            self.payload.clone(),
        )
    }

    /// Global replay order: creation time, then aggregate id, then version.
    pub fn replay_order(a: &StoredEvent, b: &StoredEvent) -> std::cmp::Ordering {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.aggregate_id.cmp(&b.aggregate_id))
            .then_with(|| a.version.cmp(&b.version))
    }
}

/// Write-side storage error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Version or natural-key uniqueness violated (lost a race, or stale expectation).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The store could not be reached or did not answer in time.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be decoded.
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

/// Read access to the event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events of one aggregate, ascending by version.
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Every event, in [`StoredEvent::replay_order`].
    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Highest committed version of the aggregate (0 if none).
    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError>;

    /// Highest committed version of every stream.
    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError>;

    /// Events of one aggregate with a version above `after`, ascending.
    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;
}

/// Authoritative store and event log sharing one transactional boundary.
#[async_trait]
pub trait WriteStore: EventStore {
    /// Start a write transaction. Dropping it without `commit` rolls back.
    async fn begin(&self) -> Result<Box<dyn WriteTransaction>, EventStoreError>;

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, EventStoreError>;

    /// Every live authoritative record, ordered by id.
    async fn list_products(&self) -> Result<Vec<Product>, EventStoreError>;
}

/// One atomic unit of write work.
///
/// Reads observe committed state plus this transaction's own writes.
#[async_trait]
pub trait WriteTransaction: Send {
    async fn find_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError>;

    async fn find_product_by_name(&mut self, name: &str) -> Result<Option<Product>, EventStoreError>;

    /// Insert a new record. A taken name fails with `Conflict`.
    async fn insert_product(&mut self, product: &Product) -> Result<(), EventStoreError>;

    /// Apply field changes and stamp `version`/`updated_at`. Returns the new
    /// record, or `None` if it does not exist.
    async fn update_product(
        &mut self,
        id: ProductId,
        changes: &[FieldChange],
        version: u64,
        updated_at: DateTime<Utc>,
    ) -> Result<Option<Product>, EventStoreError>;

    /// Delete and return the record, `None` if it does not exist.
    async fn delete_product(&mut self, id: ProductId) -> Result<Option<Product>, EventStoreError>;

    async fn latest_version(&mut self, aggregate_id: AggregateId) -> Result<u64, EventStoreError>;

    /// Append one event, assigning its version from `expected_version`.
    async fn append(
        &mut self,
        event: UncommittedEvent,
        expected_version: ExpectedVersion,
    ) -> Result<StoredEvent, EventStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), EventStoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn events_for(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).events_for(aggregate_id).await
    }

    async fn all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).all_events().await
    }

    async fn latest_version(&self, aggregate_id: AggregateId) -> Result<u64, EventStoreError> {
        (**self).latest_version(aggregate_id).await
    }

    async fn stream_heads(&self) -> Result<HashMap<AggregateId, u64>, EventStoreError> {
        (**self).stream_heads().await
    }

    async fn events_after(
        &self,
        aggregate_id: AggregateId,
        after: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).events_after(aggregate_id, after).await
    }
}

/// Verify an expectation against the current stream version and return the
/// version the next event gets.
pub(crate) fn next_version(
    aggregate_id: AggregateId,
    expected_version: ExpectedVersion,
    current: u64,
) -> Result<u64, EventStoreError> {
    expected_version.check(current).map_err(|_| {
        EventStoreError::Conflict(format!(
            "stream {aggregate_id} is at version {current}, expected {expected_version:?}"
        ))
    })?;
    Ok(expected_version.next_version(current))
}
