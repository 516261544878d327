use chrono::{DateTime, Utc};
use shelf_core::AggregateId;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - scoped to exactly one aggregate
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "products.product.created").
    fn event_type(&self) -> &'static str;

    /// The aggregate this event belongs to.
    fn aggregate_id(&self) -> AggregateId;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
