//! Product read-model projector.
//!
//! Executes the pure projection rules (`shelf_products::plan`) against a
//! [`ReadStore`] and keeps the per-aggregate checkpoint in step.
//!
//! Live projection and rebuilds never interleave: live projection holds the
//! gate shared, a rebuild holds it exclusively for its whole run.
//!
//! Live calls for one aggregate are applied one at a time (the worker and a
//! catch-up pass may deliver the same stream concurrently). Across processes
//! the stores keep the read model monotonic instead: patches apply only on
//! top of the preceding version, snapshots never replace a newer record, and
//! checkpoints never move backwards.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, warn};

use shelf_core::AggregateId;
use shelf_events::EventEnvelope;
use shelf_products::{
    EventDecodeError, ProductEvent, ProductId, ProductView, SkipReason, ViewAction, plan,
};

use super::checkpoint_store::CheckpointStore;
use crate::read_model::{InsertOutcome, ReadStore, ReadStoreError};

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The event type is not one this projector knows (newer producer).
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("failed to deserialize event payload: {0}")]
    Deserialize(String),

    #[error(transparent)]
    Store(#[from] ReadStoreError),
}

impl From<EventDecodeError> for ProjectionError {
    fn from(value: EventDecodeError) -> Self {
        match value {
            EventDecodeError::UnknownType(t) => ProjectionError::UnknownEventType(t),
            other => ProjectionError::Deserialize(other.to_string()),
        }
    }
}

/// What applying one event did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProjectionOutcome {
    Applied,
    Skipped(SkipReason),
}

/// Exclusive access to the read model, held by a rebuild.
pub struct ExclusiveProjection<'a> {
    projector: &'a Projector,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl ExclusiveProjection<'_> {
    pub async fn apply(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        self.projector.apply_unguarded(envelope).await
    }

    pub fn reads(&self) -> &dyn ReadStore {
        self.projector.reads.as_ref()
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.projector.checkpoints.as_ref()
    }
}

/// Per-aggregate serialization slots; aggregates sharing a slot also wait on
/// each other.
const AGGREGATE_LOCK_SLOTS: usize = 64;

pub struct Projector {
    reads: Arc<dyn ReadStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    gate: RwLock<()>,
    aggregate_locks: Vec<Mutex<()>>,
}

impl Projector {
    pub fn new(reads: Arc<dyn ReadStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            reads,
            checkpoints,
            gate: RwLock::new(()),
            aggregate_locks: (0..AGGREGATE_LOCK_SLOTS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn reads(&self) -> &Arc<dyn ReadStore> {
        &self.reads
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Apply one committed event (live path). Waits while a rebuild runs.
    pub async fn project(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        let _shared = self.gate.read().await;
        let _serial = self.aggregate_lock(envelope.aggregate_id()).lock().await;
        self.apply_unguarded(envelope).await
    }

    fn aggregate_lock(&self, aggregate_id: AggregateId) -> &Mutex<()> {
        let slot = aggregate_id.as_uuid().as_u128() % self.aggregate_locks.len() as u128;
        &self.aggregate_locks[slot as usize]
    }

    /// Pause live projection until the returned guard is dropped.
    pub async fn exclusive(&self) -> ExclusiveProjection<'_> {
        ExclusiveProjection {
            projector: self,
            _guard: self.gate.write().await,
        }
    }

    async fn apply_unguarded(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<ProjectionOutcome, ProjectionError> {
        let event = ProductEvent::decode(envelope.event_type(), envelope.payload())?;
        let aggregate_id = envelope.aggregate_id();
        let product_id = ProductId::new(aggregate_id);
        let version = envelope.version();

        let checkpoint = self.checkpoints.get(aggregate_id).await?;
        if version <= checkpoint {
            debug!(%aggregate_id, version, checkpoint, "skipping already applied event");
            return Ok(ProjectionOutcome::Skipped(SkipReason::AlreadyApplied));
        }

        let current = self.reads.get(product_id).await?;
        let outcome = match plan(current.as_ref(), checkpoint, version, &event) {
            ViewAction::Insert(view) => match self.reads.insert(&view).await? {
                InsertOutcome::Inserted => ProjectionOutcome::Applied,
                InsertOutcome::AlreadyExists => {
                    ProjectionOutcome::Skipped(SkipReason::DuplicateCreate)
                }
            },
            ViewAction::Patch {
                product_id,
                changes,
                version,
                updated_at,
            } => {
                let modified = self
                    .reads
                    .find_and_modify(product_id, &changes, version, updated_at)
                    .await?;
                match modified {
                    Some(_) => ProjectionOutcome::Applied,
                    // Another writer moved the record between read and modify.
                    None => match self.reads.get(product_id).await? {
                        Some(newer) if newer.version >= version => {
                            debug!(%aggregate_id, version, stored = newer.version, "newer record already projected");
                            ProjectionOutcome::Skipped(SkipReason::AlreadyApplied)
                        }
                        _ => match plan(None, checkpoint, version, &event) {
                            ViewAction::Put(view) => self.put_snapshot(&view).await?,
                            _ => ProjectionOutcome::Applied,
                        },
                    },
                }
            }
            ViewAction::Put(view) => {
                debug!(%aggregate_id, version, "rebuilding read record from event snapshot");
                self.put_snapshot(&view).await?
            }
            ViewAction::Remove(id) => {
                self.reads.remove(id).await?;
                ProjectionOutcome::Applied
            }
            ViewAction::Skip(reason) => ProjectionOutcome::Skipped(reason),
        };

        if let ProjectionOutcome::Skipped(reason) = outcome {
            if !reason.advances_checkpoint() {
                return Ok(outcome);
            }
            warn!(
                %aggregate_id,
                version,
                event_type = envelope.event_type(),
                ?reason,
                "event left the read model unchanged"
            );
        }

        self.checkpoints.set(aggregate_id, version).await?;
        debug!(%aggregate_id, version, event_type = envelope.event_type(), "projected event");
        Ok(outcome)
    }

    async fn put_snapshot(&self, view: &ProductView) -> Result<ProjectionOutcome, ProjectionError> {
        Ok(if self.reads.upsert(view).await? {
            ProjectionOutcome::Applied
        } else {
            ProjectionOutcome::Skipped(SkipReason::AlreadyApplied)
        })
    }
}
