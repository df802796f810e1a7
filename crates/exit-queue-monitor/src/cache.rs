//! Short-lived cache of the chain head shared by all pollers.

use std::time::Duration;

use exit_queue_types::BlockPointer;
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::debug;

use crate::{api::BeaconApi, error::Result};

/// Head observation with the instant it was made.
#[derive(Debug, Clone, Copy)]
struct CachedHead {
    pointer: BlockPointer,
    observed_at: Instant,
}

/// Process-wide cache of the current `(epoch, slot)`.
///
/// The entry is replaced wholesale, never mutated in place. Refreshes are
/// serialized so that when several pollers notice staleness together only
/// the first one asks the beacon node.
pub struct SharedProgressCache {
    ttl: Duration,
    slots_per_epoch: u64,
    entry: RwLock<Option<CachedHead>>,
    refresh: Mutex<()>,
}

impl SharedProgressCache {
    pub fn new(ttl: Duration, slots_per_epoch: u64) -> Self {
        Self {
            ttl,
            slots_per_epoch,
            entry: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Cached head if it is younger than the TTL.
    pub async fn get(&self) -> Option<BlockPointer> {
        let entry = *self.entry.read().await;
        entry
            .filter(|head| head.observed_at.elapsed() <= self.ttl)
            .map(|head| head.pointer)
    }

    /// Replace the cached head.
    pub async fn update(&self, pointer: BlockPointer) {
        *self.entry.write().await = Some(CachedHead {
            pointer,
            observed_at: Instant::now(),
        });
    }

    /// Current head, from the cache when fresh, otherwise from the beacon node.
    ///
    /// A failed refresh leaves the cache untouched.
    pub async fn resolve(&self, api: &dyn BeaconApi) -> Result<BlockPointer> {
        if let Some(pointer) = self.get().await {
            return Ok(pointer);
        }

        let _guard = self.refresh.lock().await;

        // Another poller may have refreshed while we waited.
        if let Some(pointer) = self.get().await {
            return Ok(pointer);
        }

        let head = api.get_head_block().await?;
        let pointer = BlockPointer::with_epoch_length(head.slot, self.slots_per_epoch);
        debug!(slot = pointer.slot, epoch = pointer.epoch, "Refreshed head");
        self.update(pointer).await;
        Ok(pointer)
    }
}
