//! Product read-model projection.
//!
//! The projection consumes committed product events and maintains the
//! query-optimized read model. It is:
//! - **Rebuildable**: from the event log (`replay`) or the authoritative store (`resync`)
//! - **Idempotent**: checkpoints make redelivery a no-op
//! - **Self-healing**: updates carry enough state to recreate a missing record

pub mod checkpoint_store;
pub mod projector;
pub mod rebuild;

pub use checkpoint_store::{CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore};
pub use projector::{ExclusiveProjection, ProjectionError, ProjectionOutcome, Projector};
pub use rebuild::{CatchUpReport, RebuildCoordinator, RebuildError, ReplayReport, ResyncReport};
