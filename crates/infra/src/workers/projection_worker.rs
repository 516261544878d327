use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use shelf_events::{EventEnvelope, Subscription};

use crate::projections::{ProjectionError, ProjectionOutcome, Projector, RebuildCoordinator};

/// Counters kept by a running worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    projected: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    caught_up: AtomicU64,
}

impl WorkerStats {
    /// Events applied from the queue.
    pub fn projected(&self) -> u64 {
        self.projected.load(Ordering::Relaxed)
    }

    /// Deliveries that left the read model unchanged (duplicates, unknown types).
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Deliveries that failed; catch-up retries them.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Events applied by catch-up passes.
    pub fn caught_up(&self) -> u64 {
        self.caught_up.load(Ordering::Relaxed)
    }
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// Messages already queued are projected before the worker exits.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(error = %err, "projection worker task ended abnormally");
            }
        }
    }
}

/// Drives the projector from the projection queue.
///
/// - Projects each queued event (idempotent, so redelivery is harmless)
/// - Runs a catch-up pass at start and every `catch_up_interval`
/// - Logs and counts failures; nothing is surfaced to command callers
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    pub fn spawn(
        name: &'static str,
        subscription: Subscription<EventEnvelope<JsonValue>>,
        projector: Arc<Projector>,
        coordinator: Arc<RebuildCoordinator>,
        catch_up_interval: Option<Duration>,
    ) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let stats = Arc::new(WorkerStats::default());

        let worker = Worker {
            name,
            projector,
            coordinator,
            stats: stats.clone(),
        };
        let join = tokio::spawn(worker.run(subscription, shutdown_rx, catch_up_interval));

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            stats,
        }
    }
}

struct Worker {
    name: &'static str,
    projector: Arc<Projector>,
    coordinator: Arc<RebuildCoordinator>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(
        self,
        mut subscription: Subscription<EventEnvelope<JsonValue>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        catch_up_interval: Option<Duration>,
    ) {
        info!(worker = self.name, "projection worker started");
        self.catch_up().await;

        let mut ticker = catch_up_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                Ok(()) = &mut shutdown_rx => break,
                message = subscription.recv() => match message {
                    Some(envelope) => self.handle(&envelope).await,
                    None => break,
                },
                _ = next_tick(&mut ticker) => self.catch_up().await,
            }
        }

        subscription.close();
        while let Some(envelope) = subscription.try_recv() {
            self.handle(&envelope).await;
        }
        info!(worker = self.name, "projection worker stopped");
    }

    async fn handle(&self, envelope: &EventEnvelope<JsonValue>) {
        match self.projector.project(envelope).await {
            Ok(ProjectionOutcome::Applied) => {
                self.stats.projected.fetch_add(1, Ordering::Relaxed);
            }
            Ok(ProjectionOutcome::Skipped(reason)) => {
                debug!(
                    worker = self.name,
                    aggregate_id = %envelope.aggregate_id(),
                    version = envelope.version(),
                    ?reason,
                    "delivery skipped"
                );
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(ProjectionError::UnknownEventType(event_type)) => {
                warn!(
                    worker = self.name,
                    aggregate_id = %envelope.aggregate_id(),
                    %event_type,
                    "ignoring event of unknown type"
                );
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(
                    worker = self.name,
                    aggregate_id = %envelope.aggregate_id(),
                    version = envelope.version(),
                    event_type = envelope.event_type(),
                    error = %err,
                    "projection worker handler failed"
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn catch_up(&self) {
        match self.coordinator.catch_up().await {
            Ok(report) => {
                self.stats
                    .caught_up
                    .fetch_add(report.applied, Ordering::Relaxed);
            }
            Err(err) => warn!(worker = self.name, error = %err, "catch-up pass failed"),
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
