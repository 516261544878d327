use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use shelf_core::AggregateId;
use shelf_events::Event;

use crate::product::{ProductDetails, ProductId, ProductPatch};

/// Aggregate type recorded with every product event.
pub const AGGREGATE_TYPE: &str = "products.product";

/// The closed set of event kinds this crate understands.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "products.product.created",
            EventKind::Updated => "products.product.updated",
            EventKind::Deleted => "products.product.deleted",
        }
    }

    /// `None` for event types written by a newer producer.
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "products.product.created" => Some(EventKind::Created),
            "products.product.updated" => Some(EventKind::Updated),
            "products.product.deleted" => Some(EventKind::Deleted),
            _ => None,
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event: ProductCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub product_id: ProductId,
    #[serde(flatten)]
    pub details: ProductDetails,
    pub created_at: DateTime<Utc>,
}

/// Event: ProductUpdated.
///
/// Carries the full pre-update state so a consumer that never saw the
/// creation can still rebuild the product (`previous` merged with `changes`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductUpdated {
    pub product_id: ProductId,
    pub changes: ProductPatch,
    pub previous: ProductDetails,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProductUpdated {
    /// Product state right after this update.
    pub fn resulting_details(&self) -> ProductDetails {
        self.changes.merged_over(&self.previous)
    }
}

/// Event: ProductDeleted (tombstone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDeleted {
    pub product_id: ProductId,
    pub name: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductEvent {
    Created(ProductCreated),
    Updated(ProductUpdated),
    Deleted(ProductDeleted),
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("malformed {event_type} payload: {source}")]
    Malformed {
        event_type: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

impl ProductEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProductEvent::Created(_) => EventKind::Created,
            ProductEvent::Updated(_) => EventKind::Updated,
            ProductEvent::Deleted(_) => EventKind::Deleted,
        }
    }

    pub fn product_id(&self) -> ProductId {
        match self {
            ProductEvent::Created(e) => e.product_id,
            ProductEvent::Updated(e) => e.product_id,
            ProductEvent::Deleted(e) => e.product_id,
        }
    }

    /// Serialize the payload only; the kind travels as the stored `event_type`.
    pub fn to_payload(&self) -> serde_json::Result<JsonValue> {
        match self {
            ProductEvent::Created(e) => serde_json::to_value(e),
            ProductEvent::Updated(e) => serde_json::to_value(e),
            ProductEvent::Deleted(e) => serde_json::to_value(e),
        }
    }

    /// Decode a stored `(event_type, payload)` pair.
    pub fn decode(event_type: &str, payload: &JsonValue) -> Result<Self, EventDecodeError> {
        let kind = EventKind::parse(event_type)
            .ok_or_else(|| EventDecodeError::UnknownType(event_type.to_string()))?;
        let malformed = |source| EventDecodeError::Malformed {
            event_type: kind,
            source,
        };

        let event = match kind {
            EventKind::Created => {
                ProductEvent::Created(serde_json::from_value(payload.clone()).map_err(malformed)?)
            }
            EventKind::Updated => {
                ProductEvent::Updated(serde_json::from_value(payload.clone()).map_err(malformed)?)
            }
            EventKind::Deleted => {
                ProductEvent::Deleted(serde_json::from_value(payload.clone()).map_err(malformed)?)
            }
        };
        Ok(event)
    }
}

impl Event for ProductEvent {
    fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    fn aggregate_id(&self) -> AggregateId {
        self.product_id().0
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProductEvent::Created(e) => e.created_at,
            ProductEvent::Updated(e) => e.updated_at,
            ProductEvent::Deleted(e) => e.deleted_at,
        }
    }
}
