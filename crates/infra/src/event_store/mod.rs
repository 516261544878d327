//! Append-only event log and the authoritative product store.
//!
//! The two share one transactional boundary ([`WriteTransaction`]): a command
//! mutates the authoritative record and appends its event inside the same
//! transaction, so neither can be committed without the other.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryWriteStore;
pub use postgres::PostgresWriteStore;
pub use r#trait::{
    EventStore, EventStoreError, StoredEvent, UncommittedEvent, WriteStore, WriteTransaction,
};
