//! Read-model record and the pure projection rules.
//!
//! `plan()` decides what an event does to the read model; it never touches
//! storage. The infra projector executes the returned [`ViewAction`] and then
//! advances the per-aggregate checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{ProductCreated, ProductDeleted, ProductEvent, ProductUpdated};
use crate::product::{FieldChange, Product, ProductDetails, ProductId};

/// Denormalized, query-optimized product record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductView {
    pub product_id: ProductId,
    #[serde(flatten)]
    pub details: ProductDetails,
    /// Version of the last event reflected here.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Business time of the last applied event.
    pub updated_at: DateTime<Utc>,
}

impl ProductView {
    /// Snapshot of an authoritative record (used by resync).
    pub fn from_product(product: &Product) -> Self {
        Self {
            product_id: product.id,
            details: product.details.clone(),
            version: product.version,
            created_at: product.created_at,
            updated_at: product.updated_at,
        }
    }

    fn from_created(e: &ProductCreated, version: u64) -> Self {
        Self {
            product_id: e.product_id,
            details: e.details.clone(),
            version,
            created_at: e.created_at,
            updated_at: e.created_at,
        }
    }

    /// Apply a list of field changes produced by a `Patch` action.
    pub fn apply_changes(&mut self, changes: &[FieldChange], version: u64, updated_at: DateTime<Utc>) {
        for change in changes {
            change.apply(&mut self.details);
        }
        self.version = version;
        self.updated_at = updated_at;
    }
}

/// Why an event left the read model untouched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// `version <= checkpoint`: duplicate or stale delivery.
    AlreadyApplied,
    /// A Created event for a record that already exists.
    DuplicateCreate,
    /// A Deleted event for a record that is already gone.
    MissingOnDelete,
}

impl SkipReason {
    /// Whether the checkpoint should still move forward to the event's version.
    pub fn advances_checkpoint(self) -> bool {
        !matches!(self, SkipReason::AlreadyApplied)
    }
}

/// Read-model mutation decided for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewAction {
    /// Insert a new record (must not exist yet).
    Insert(ProductView),
    /// Modify an existing record in place.
    Patch {
        product_id: ProductId,
        changes: Vec<FieldChange>,
        version: u64,
        updated_at: DateTime<Utc>,
    },
    /// Write a whole record, replacing whatever is there.
    Put(ProductView),
    Remove(ProductId),
    Skip(SkipReason),
}

/// Decide how `event` (stored at `version`) changes the read model.
///
/// `current` is the stored read record, `checkpoint` the highest version
/// already applied for this aggregate (0 if none).
pub fn plan(
    current: Option<&ProductView>,
    checkpoint: u64,
    version: u64,
    event: &ProductEvent,
) -> ViewAction {
    if version <= checkpoint {
        return ViewAction::Skip(SkipReason::AlreadyApplied);
    }

    match event {
        ProductEvent::Created(e) => match current {
            Some(_) => ViewAction::Skip(SkipReason::DuplicateCreate),
            None => ViewAction::Insert(ProductView::from_created(e, version)),
        },
        ProductEvent::Updated(e) => plan_update(current, version, e),
        ProductEvent::Deleted(ProductDeleted { product_id, .. }) => match current {
            Some(_) => ViewAction::Remove(*product_id),
            None => ViewAction::Skip(SkipReason::MissingOnDelete),
        },
    }
}

fn plan_update(current: Option<&ProductView>, version: u64, e: &ProductUpdated) -> ViewAction {
    match current {
        Some(view) if view.version + 1 == version => ViewAction::Patch {
            product_id: e.product_id,
            changes: e.changes.changes(),
            version,
            updated_at: e.updated_at,
        },
        // Missing record or a version gap: rebuild from the event's own snapshot.
        _ => ViewAction::Put(ProductView {
            product_id: e.product_id,
            details: e.resulting_details(),
            version,
            created_at: current.map_or(e.created_at, |v| v.created_at),
            updated_at: e.updated_at,
        }),
    }
}
