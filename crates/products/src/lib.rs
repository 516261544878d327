//! Products domain module.
//!
//! Business rules for the catalog product: input validation, the authoritative
//! record, the event payloads, and the pure read-model projection rules.
//! Deterministic domain logic only (no IO, no storage).

pub mod event;
pub mod product;
pub mod view;

pub use event::{
    AGGREGATE_TYPE, EventDecodeError, EventKind, ProductCreated, ProductDeleted, ProductEvent,
    ProductUpdated,
};
pub use product::{
    FieldChange, NewProduct, Product, ProductDetails, ProductField, ProductId, ProductPatch,
};
pub use view::{ProductView, SkipReason, ViewAction, plan};
