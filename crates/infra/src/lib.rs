//! Infrastructure layer: stores, command processing, projection, wiring.

pub mod commands;
pub mod config;
pub mod db;
pub mod engine;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod workers;

pub use commands::{CommandError, CommandProcessor, retry_on_conflict};
pub use config::{Backend, ConfigError, LogFormat, SyncConfig};
pub use engine::{EngineError, ProjectionBus, SyncEngine};

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;
