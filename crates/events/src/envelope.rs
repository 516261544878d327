use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shelf_core::{AggregateId, EventId};

/// Envelope for a committed event, carrying stream metadata.
///
/// This is the unit handed from the write side to the projector.
///
/// Notes:
/// - **Append-only**: `version` is monotonically increasing per aggregate stream, starting at 1.
/// - `event_type` is kept as a string so newer producers can emit types older
///   consumers do not know yet.
/// - `payload` is the domain-agnostic event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    aggregate_id: AggregateId,
    aggregate_type: String,
    event_type: String,

    /// Position in the aggregate stream.
    version: u64,

    recorded_at: DateTime<Utc>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(
        event_id: EventId,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_type: impl Into<String>,
        version: u64,
        recorded_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            version,
            recorded_at,
            payload,
        }
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
