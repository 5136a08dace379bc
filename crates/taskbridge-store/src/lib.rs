//! Persistence, gateway and pipeline layer for taskbridge.
//!
//! This crate owns everything that touches the outside world: the safe-I/O
//! substrate, the markdown vault indexer/editor, the reminders gateway
//! seam, the persisted index/link/changeset artifacts, and the engine that
//! drives a full reconcile run.

pub mod changeset;
pub mod config;
pub mod engine;
pub mod gateway;
pub mod index_store;
pub mod link_store;
pub mod reminders;
pub mod safe_io;
pub mod vault;

pub use config::{CreationCaps, ListConfig, SyncConfig, VaultConfig};
pub use engine::{
    CancelFlag, CounterpartOptions, CreateDirection, Disposition, RunOptions, RunReport,
    SyncEngine,
};
pub use gateway::{GatewayError, ItemFields, RemindersGateway, RemoteItem};
