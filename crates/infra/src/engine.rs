//! Engine wiring.
//!
//! [`SyncEngine`] owns one instance of every component and is constructed
//! once from a [`SyncConfig`]:
//!
//! ```text
//! commands ──append──▶ WriteStore ◀──read── RebuildCoordinator
//!    │                                            │
//!    └──publish──▶ ChannelBus ──▶ ProjectionWorker ──▶ Projector ──▶ ReadStore
//! ```

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use shelf_core::AggregateId;
use shelf_events::{ChannelBus, EventEnvelope, Subscription};
use shelf_products::{Product, ProductId, ProductView};

use crate::commands::CommandProcessor;
use crate::config::{Backend, ConfigError, SyncConfig};
use crate::db;
use crate::event_store::{
    EventStore, EventStoreError, InMemoryWriteStore, PostgresWriteStore, StoredEvent, WriteStore,
};
use crate::projections::{
    CatchUpReport, CheckpointStore, InMemoryCheckpointStore, PostgresCheckpointStore, Projector,
    RebuildCoordinator, RebuildError, ReplayReport, ResyncReport,
};
use crate::read_model::{InMemoryReadStore, PostgresReadStore, ReadStore, ReadStoreError};
use crate::workers::{ProjectionWorker, WorkerHandle};

/// Projection hand-off queue used by the engine.
pub type ProjectionBus = ChannelBus<EventEnvelope<JsonValue>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("the projection worker was already started")]
    WorkerStarted,
}

pub struct SyncEngine {
    store: Arc<dyn WriteStore>,
    commands: CommandProcessor<ProjectionBus>,
    projector: Arc<Projector>,
    coordinator: Arc<RebuildCoordinator>,
    subscription: Mutex<Option<Subscription<EventEnvelope<JsonValue>>>>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Build the engine for the configured backend.
    pub async fn from_config(config: &SyncConfig) -> Result<Self, EngineError> {
        match config.backend {
            Backend::InMemory => Ok(Self::in_memory(config)),
            Backend::Postgres => Self::connect(config).await,
        }
    }

    pub fn in_memory(config: &SyncConfig) -> Self {
        Self::with_stores(
            config,
            Arc::new(InMemoryWriteStore::new()),
            Arc::new(InMemoryReadStore::new()),
            Arc::new(InMemoryCheckpointStore::new()),
        )
    }

    /// Connect to Postgres and create missing tables.
    pub async fn connect(config: &SyncConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let write_url = config
            .database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let write_pool =
            db::connect(write_url, config.max_connections, config.store_timeout()).await?;
        db::migrate_write(&write_pool).await?;

        let read_pool = match config.read_url() {
            Some(url) if url != write_url => {
                db::connect(url, config.max_connections, config.store_timeout()).await?
            }
            _ => write_pool.clone(),
        };
        db::migrate_read(&read_pool).await?;

        info!(separate_read_db = config.read_database_url.is_some(), "postgres backend ready");

        Ok(Self::with_stores(
            config,
            Arc::new(PostgresWriteStore::new(write_pool)),
            Arc::new(PostgresReadStore::new(read_pool.clone())),
            Arc::new(PostgresCheckpointStore::new(read_pool)),
        ))
    }

    pub fn with_stores(
        config: &SyncConfig,
        store: Arc<dyn WriteStore>,
        reads: Arc<dyn ReadStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let (bus, subscription) = ChannelBus::bounded(config.queue_capacity);
        let projector = Arc::new(Projector::new(reads, checkpoints));
        let coordinator = Arc::new(RebuildCoordinator::new(store.clone(), projector.clone()));

        Self {
            commands: CommandProcessor::new(store.clone(), bus, config.store_timeout()),
            store,
            projector,
            coordinator,
            subscription: Mutex::new(Some(subscription)),
            config: config.clone(),
        }
    }

    pub fn commands(&self) -> &CommandProcessor<ProjectionBus> {
        &self.commands
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    /// Start the projection worker. Only one worker consumes the queue.
    pub fn start_worker(&self) -> Result<WorkerHandle, EngineError> {
        let subscription = self
            .subscription
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or(EngineError::WorkerStarted)?;

        Ok(ProjectionWorker::spawn(
            "product-projection",
            subscription,
            self.projector.clone(),
            self.coordinator.clone(),
            self.config.catch_up_interval(),
        ))
    }

    // Queries (read model only)

    pub async fn find_by_id(&self, id: ProductId) -> Result<Option<ProductView>, ReadStoreError> {
        self.projector.reads().get(id).await
    }

    pub async fn find_all(&self) -> Result<Vec<ProductView>, ReadStoreError> {
        self.projector.reads().list().await
    }

    // Admin

    pub async fn list_all_events(&self) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.all_events().await
    }

    pub async fn list_events_for(
        &self,
        aggregate_id: AggregateId,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.events_for(aggregate_id).await
    }

    /// Authoritative records, for operator inspection.
    pub async fn list_products(&self) -> Result<Vec<Product>, EventStoreError> {
        self.store.list_products().await
    }

    pub async fn resync(&self) -> Result<ResyncReport, RebuildError> {
        self.coordinator.resync().await
    }

    pub async fn replay(&self) -> Result<ReplayReport, RebuildError> {
        self.coordinator.replay().await
    }

    pub async fn catch_up(&self) -> Result<CatchUpReport, RebuildError> {
        self.coordinator.catch_up().await
    }
}
