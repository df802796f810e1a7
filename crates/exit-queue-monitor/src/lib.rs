//! Exit-queue monitor - polls a beacon node for validator lifecycle events
//! and persists them idempotently.
//!
//! This crate provides functionality to:
//! - Extract voluntary exits and partial withdrawals from each new block
//! - Snapshot the active-exiting validator queue
//! - Tally withdrawal credential types once per even epoch
//! - Store every observation in SQLite, deduplicated by natural key
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use exit_queue_monitor::{BeaconClient, Config, SharedProgressCache, SqliteStore};
//! use exit_queue_monitor::service::{PollingScheduler, exit_queue::ExitQueuePoller};
//!
//! let config = Config::load("config.toml")?;
//! let url = config.validate()?.clone();
//! let beacon = Arc::new(BeaconClient::new(url, &config.beacon)?);
//! let store = Arc::new(SqliteStore::open(&config.database.path)?);
//! let cache = Arc::new(SharedProgressCache::new(
//!     config.polling.head_cache_ttl(),
//!     config.polling.slots_per_epoch,
//! ));
//!
//! let poller = ExitQueuePoller::new(beacon, store, cache, config.polling.slot_duration());
//! PollingScheduler::new(shutdown_token).run(poller).await?;
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod rpc;
pub mod service;
pub mod storage;
pub mod util;

#[cfg(test)]
mod mock;

// Re-export main types at crate root for convenience.
pub use api::{BeaconApi, BeaconBlock, ValidatorId, ValidatorState, ValidatorStatus};
pub use cache::SharedProgressCache;
pub use config::{BeaconConfig, Config, DatabaseConfig, PollingConfig};
pub use error::{Error, Result};
pub use rpc::BeaconClient;
pub use storage::{BlockWrites, SqliteStore, Store, WriteOutcome};

// Re-export the record types that appear in our public API.
pub use exit_queue_types::{
    BlockPointer, CredentialsSample, ExitQueueSnapshot, PartialWithdrawalRecord,
    VoluntaryExitRecord,
};
