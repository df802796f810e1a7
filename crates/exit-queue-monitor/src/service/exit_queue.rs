use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use exit_queue_types::{BlockPointer, ExitQueueSnapshot};
use tracing::{debug, info, warn};

use crate::{
    api::{BeaconApi, BeaconBlockBody, ValidatorStatus},
    cache::SharedProgressCache,
    error::Result,
    reconcile::{
        exit_records, index_validators, partial_withdrawal_records, referenced_validators,
        summarize_exit_queue,
    },
    service::{Poller, ProgressWatermark},
    storage::Store,
};

/// What one [`ExitQueueReconciler::process`] call saw and wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub pointer: BlockPointer,
    pub exits_seen: usize,
    pub exits_inserted: usize,
    /// Withdrawal requests in the block, full exits included.
    pub withdrawals_seen: usize,
    pub withdrawals_inserted: usize,
    pub snapshot: Option<ExitQueueSnapshot>,
}

/// Extracts voluntary exits and partial withdrawals from one block and
/// records exit-queue snapshots.
pub struct ExitQueueReconciler {
    beacon: Arc<dyn BeaconApi>,
    store: Arc<dyn Store>,
    has_baseline: bool,
}

impl ExitQueueReconciler {
    pub fn new(beacon: Arc<dyn BeaconApi>, store: Arc<dyn Store>) -> Self {
        Self {
            beacon,
            store,
            has_baseline: false,
        }
    }

    /// Whether a snapshot has been persisted since this reconciler was created.
    pub fn has_baseline(&self) -> bool {
        self.has_baseline
    }

    /// Reconcile the block at `at`.
    ///
    /// Every fetch happens before the write, so a failed fetch persists
    /// nothing. Exits, withdrawals and the snapshot are written in one
    /// transaction.
    pub async fn process(&mut self, at: BlockPointer) -> Result<ReconciliationResult> {
        let body = match self.beacon.get_block(at.slot).await? {
            Some(block) => block.body,
            None => {
                debug!(slot = at.slot, "Empty slot");
                BeaconBlockBody::default()
            }
        };

        let ids = referenced_validators(&body);
        let validators = if ids.is_empty() {
            Default::default()
        } else {
            index_validators(self.beacon.get_validators(None, Some(&ids)).await?)
        };

        let needs_snapshot = !body.voluntary_exits.is_empty() || !self.has_baseline;
        let exiting = if needs_snapshot {
            Some(
                self.beacon
                    .get_validators(Some(ValidatorStatus::ActiveExiting), None)
                    .await?,
            )
        } else {
            None
        };

        let exits = exit_records(at, &body.voluntary_exits, &validators);
        let withdrawals = match &body.execution_payload {
            Some(payload) => {
                partial_withdrawal_records(at, payload, body.withdrawal_requests(), &validators)
            }
            None => Vec::new(),
        };
        let snapshot = exiting.map(|exiting| summarize_exit_queue(at, exiting));

        let writes = self
            .store
            .persist_block(&exits, &withdrawals, snapshot.as_ref())
            .await?;

        for record in &exits {
            debug!(
                slot = at.slot,
                validator_index = record.validator_index,
                exit_epoch = record.exit_epoch,
                withdrawable_epoch = record.withdrawable_epoch,
                "Observed voluntary exit"
            );
        }
        if writes.exits_inserted > 0 {
            info!(
                slot = at.slot,
                count = writes.exits_inserted,
                "Recorded voluntary exits"
            );
        }
        if writes.withdrawals_inserted > 0 {
            info!(
                slot = at.slot,
                count = writes.withdrawals_inserted,
                "Recorded partial withdrawals"
            );
        }

        if let Some(snapshot) = &snapshot {
            self.has_baseline = true;
            if snapshot.is_empty() {
                info!(slot = at.slot, epoch = at.epoch, "Recorded empty exit queue snapshot");
            } else {
                info!(
                    slot = at.slot,
                    epoch = at.epoch,
                    validators_in_queue = snapshot.validators_in_queue,
                    earliest_exit_epoch = snapshot.earliest_exit_epoch,
                    latest_exit_epoch = snapshot.latest_exit_epoch,
                    balance_in_queue = snapshot.balance_in_queue,
                    "Recorded exit queue snapshot"
                );
            }
        }

        Ok(ReconciliationResult {
            pointer: at,
            exits_seen: body.voluntary_exits.len(),
            exits_inserted: writes.exits_inserted,
            withdrawals_seen: body.withdrawal_requests().len(),
            withdrawals_inserted: writes.withdrawals_inserted,
            snapshot,
        })
    }
}

/// Result of one [`ExitQueuePoller::poll_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Processed(ReconciliationResult),
    /// The head has not moved past the watermark.
    UpToDate { slot: u64 },
    /// The head is behind the watermark.
    Regressed { slot: u64, last_processed_slot: u64 },
}

/// Runs the [`ExitQueueReconciler`] once per new head slot.
pub struct ExitQueuePoller {
    beacon: Arc<dyn BeaconApi>,
    cache: Arc<SharedProgressCache>,
    reconciler: ExitQueueReconciler,
    watermark: ProgressWatermark,
    slot_duration: Duration,
}

impl ExitQueuePoller {
    pub fn new(
        beacon: Arc<dyn BeaconApi>,
        store: Arc<dyn Store>,
        cache: Arc<SharedProgressCache>,
        slot_duration: Duration,
    ) -> Self {
        Self {
            reconciler: ExitQueueReconciler::new(beacon.clone(), store),
            beacon,
            cache,
            watermark: ProgressWatermark::new(),
            slot_duration,
        }
    }

    pub fn watermark(&self) -> ProgressWatermark {
        self.watermark
    }

    /// Resolve the head and reconcile it if it is past the watermark.
    ///
    /// The watermark only advances after the reconciler succeeded.
    pub async fn poll_once(&mut self) -> Result<TickOutcome> {
        let at = self.cache.resolve(self.beacon.as_ref()).await?;

        if let Some(last) = self.watermark.last_processed() {
            if at.slot < last.slot {
                warn!(
                    slot = at.slot,
                    last_processed_slot = last.slot,
                    "Head is behind last processed slot, possible reorg"
                );
                return Ok(TickOutcome::Regressed {
                    slot: at.slot,
                    last_processed_slot: last.slot,
                });
            }
            if at.slot == last.slot {
                debug!(slot = at.slot, "No new block");
                return Ok(TickOutcome::UpToDate { slot: at.slot });
            }
        }

        let result = self.reconciler.process(at).await?;
        self.watermark.advance(at);
        debug!(
            slot = at.slot,
            exits = result.exits_seen,
            withdrawals = result.withdrawals_seen,
            "Processed block"
        );
        Ok(TickOutcome::Processed(result))
    }
}

#[async_trait]
impl Poller for ExitQueuePoller {
    fn name(&self) -> &'static str {
        "exit_queue"
    }

    async fn tick(&mut self) -> Result<Duration> {
        self.poll_once().await?;
        Ok(self.slot_duration)
    }

    fn retry_delay(&self) -> Duration {
        self.slot_duration
    }
}
