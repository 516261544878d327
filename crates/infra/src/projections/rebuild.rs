//! Read-model rebuild tooling.
//!
//! Two strategies rebuild the read model from scratch:
//! - `resync`: snapshot the authoritative store (fast, loses no data the
//!   authoritative store still has)
//! - `replay`: fold the full event log through the projector (exercises the
//!   projection rules, skips event types it does not know)
//!
//! `catch_up` is the incremental variant: it re-applies only events above
//! their aggregate's checkpoint and never clears anything.
//!
//! Only one rebuild runs at a time, and live projection is paused for its
//! duration.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use shelf_products::ProductView;

use super::projector::{ProjectionError, ProjectionOutcome, Projector};
use crate::event_store::{EventStore, EventStoreError, StoredEvent, WriteStore};
use crate::read_model::ReadStoreError;

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("read store error: {0}")]
    ReadStore(#[from] ReadStoreError),

    #[error("projection error: {0}")]
    Projection(#[from] ProjectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    /// Read records written.
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Events processed (applied or deliberately left without effect).
    pub count: u64,
    /// Events of unknown type.
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CatchUpReport {
    /// Events found above their checkpoint and applied.
    pub applied: u64,
    /// Events of unknown type.
    pub skipped: u64,
    /// Events that could not be applied (logged; retried on the next pass).
    pub failed: u64,
}

pub struct RebuildCoordinator {
    store: Arc<dyn WriteStore>,
    projector: Arc<Projector>,
    running: Mutex<()>,
}

impl RebuildCoordinator {
    pub fn new(store: Arc<dyn WriteStore>, projector: Arc<Projector>) -> Self {
        Self {
            store,
            projector,
            running: Mutex::new(()),
        }
    }

    /// Rebuild every read record from the authoritative store.
    pub async fn resync(&self) -> Result<ResyncReport, RebuildError> {
        let _running = self.running.lock().await;
        let projection = self.projector.exclusive().await;
        info!("resync started");

        projection.reads().clear().await?;
        projection.checkpoints().clear().await?;

        let products = self.store.list_products().await?;
        let mut count = 0u64;
        for product in &products {
            projection
                .reads()
                .upsert(&ProductView::from_product(product))
                .await?;
            projection
                .checkpoints()
                .set(product.id.aggregate_id(), product.version)
                .await?;
            count += 1;
        }

        info!(count, "resync completed");
        Ok(ResyncReport { count })
    }

    /// Rebuild the read model by replaying the entire event log.
    pub async fn replay(&self) -> Result<ReplayReport, RebuildError> {
        let _running = self.running.lock().await;
        let projection = self.projector.exclusive().await;
        info!("replay started");

        projection.reads().clear().await?;
        projection.checkpoints().clear().await?;

        let events = self.store.all_events().await?;
        let mut report = ReplayReport {
            count: 0,
            skipped: 0,
        };

        for event in &events {
            match projection.apply(&event.to_envelope()).await {
                Ok(_) => report.count += 1,
                Err(ProjectionError::UnknownEventType(event_type)) => {
                    warn!(
                        aggregate_id = %event.aggregate_id,
                        version = event.version,
                        %event_type,
                        "skipping event of unknown type during replay"
                    );
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        aggregate_id = %event.aggregate_id,
                        version = event.version,
                        error = %err,
                        "replay aborted"
                    );
                    return Err(err.into());
                }
            }
        }

        info!(count = report.count, skipped = report.skipped, "replay completed");
        Ok(report)
    }

    /// Apply every event newer than its aggregate's checkpoint.
    ///
    /// Repairs hand-offs lost between commit and projection. Runs alongside
    /// live projection (one event at a time through the shared gate) but
    /// never alongside a rebuild. Only streams whose head is above their
    /// checkpoint are read.
    pub async fn catch_up(&self) -> Result<CatchUpReport, RebuildError> {
        let _running = self.running.lock().await;

        let checkpoints = self.projector.checkpoints().all().await?;
        let heads = self.store.stream_heads().await?;

        let mut events = Vec::new();
        for (aggregate_id, head) in heads {
            let checkpoint = checkpoints.get(&aggregate_id).copied().unwrap_or(0);
            if head > checkpoint {
                events.extend(self.store.events_after(aggregate_id, checkpoint).await?);
            }
        }
        events.sort_by(StoredEvent::replay_order);

        let mut report = CatchUpReport::default();
        for event in &events {
            match self.projector.project(&event.to_envelope()).await {
                Ok(ProjectionOutcome::Applied) => report.applied += 1,
                Ok(ProjectionOutcome::Skipped(_)) => {}
                Err(ProjectionError::UnknownEventType(event_type)) => {
                    debug!(aggregate_id = %event.aggregate_id, %event_type, "catch-up skipped unknown event type");
                    report.skipped += 1;
                }
                Err(err) => {
                    warn!(
                        aggregate_id = %event.aggregate_id,
                        version = event.version,
                        error = %err,
                        "catch-up could not apply event"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.applied > 0 || report.failed > 0 {
            info!(applied = report.applied, failed = report.failed, "catch-up pass finished");
        }
        Ok(report)
    }
}
