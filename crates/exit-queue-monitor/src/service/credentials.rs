use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use exit_queue_types::CredentialsSample;
use tracing::{debug, info, warn};

use crate::{
    api::{BeaconApi, ValidatorStatus},
    cache::SharedProgressCache,
    config::PollingConfig,
    error::Result,
    reconcile::CredentialTally,
    service::Poller,
    storage::{Store, WriteOutcome},
};

/// Result of one [`ValidatorCredentialsSampler::sample_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    Sampled {
        sample: CredentialsSample,
        outcome: WriteOutcome,
    },
    /// Odd epochs are never sampled.
    OddEpoch { epoch: u64 },
    /// The epoch is at or behind the last sampled epoch.
    AlreadySampled { epoch: u64 },
}

/// Counts withdrawal credential types of the `active_ongoing` set once per
/// even epoch.
pub struct ValidatorCredentialsSampler {
    beacon: Arc<dyn BeaconApi>,
    store: Arc<dyn Store>,
    cache: Arc<SharedProgressCache>,
    polling: PollingConfig,
    last_sampled_epoch: Option<u64>,
}

impl ValidatorCredentialsSampler {
    /// Create a sampler that resumes after the newest stored sample.
    pub async fn new(
        beacon: Arc<dyn BeaconApi>,
        store: Arc<dyn Store>,
        cache: Arc<SharedProgressCache>,
        polling: PollingConfig,
    ) -> Result<Self> {
        let last_sampled_epoch = store.latest_credentials_epoch().await?;
        if let Some(epoch) = last_sampled_epoch {
            info!(epoch, "Resuming credentials sampling after stored epoch");
        }

        Ok(Self {
            beacon,
            store,
            cache,
            polling,
            last_sampled_epoch,
        })
    }

    pub fn last_sampled_epoch(&self) -> Option<u64> {
        self.last_sampled_epoch
    }

    /// Sample the current epoch if it is even and not yet sampled.
    ///
    /// A failed fetch writes nothing and leaves the watermark in place so
    /// the epoch is retried.
    pub async fn sample_once(&mut self) -> Result<SampleOutcome> {
        let at = self.cache.resolve(self.beacon.as_ref()).await?;

        if !at.is_even_epoch() {
            debug!(epoch = at.epoch, "Odd epoch, not sampling");
            return Ok(SampleOutcome::OddEpoch { epoch: at.epoch });
        }
        if self.last_sampled_epoch.is_some_and(|last| at.epoch <= last) {
            debug!(epoch = at.epoch, "Epoch already sampled");
            return Ok(SampleOutcome::AlreadySampled { epoch: at.epoch });
        }

        let validators = self
            .beacon
            .get_validators(Some(ValidatorStatus::ActiveOngoing), None)
            .await?;
        let tally = CredentialTally::of(&validators);

        let sample = CredentialsSample {
            epoch: at.epoch,
            slot: at.slot,
            timestamp: Utc::now(),
            count_type1: tally.type1,
            count_type2: tally.type2,
        };
        let outcome = self.store.upsert_credentials_sample(&sample).await?;
        self.last_sampled_epoch = Some(at.epoch);

        info!(
            epoch = sample.epoch,
            slot = sample.slot,
            sampled = tally.sampled,
            count_type1 = sample.count_type1,
            count_type2 = sample.count_type2,
            inserted = outcome.is_inserted(),
            "Recorded withdrawal credentials sample"
        );
        self.log_finality().await;

        Ok(SampleOutcome::Sampled { sample, outcome })
    }

    async fn log_finality(&self) {
        match self.beacon.get_finality_checkpoints().await {
            Ok(checkpoints) => info!(
                finalized_epoch = checkpoints.finalized.epoch,
                justified_epoch = checkpoints.current_justified.epoch,
                "Finality checkpoints"
            ),
            Err(e) => warn!(error = %e, "Failed to get finality checkpoints"),
        }
    }

    /// Time from `slot` until the first slot of the next epoch.
    fn until_next_epoch(&self, slot: u64) -> Duration {
        let slots_per_epoch = self.polling.slots_per_epoch;
        let remaining = slots_per_epoch - slot % slots_per_epoch;
        self.polling.slot_duration() * remaining as u32
    }
}

#[async_trait]
impl Poller for ValidatorCredentialsSampler {
    fn name(&self) -> &'static str {
        "credentials"
    }

    async fn tick(&mut self) -> Result<Duration> {
        let delay = match self.sample_once().await? {
            // Skip the following odd epoch and wake at the start of the next
            // even one, wherever in its epoch the sample was taken.
            SampleOutcome::Sampled { sample, .. } => {
                self.until_next_epoch(sample.slot) + self.polling.epoch_duration()
            }
            SampleOutcome::OddEpoch { .. } | SampleOutcome::AlreadySampled { .. } => {
                match self.cache.get().await {
                    Some(at) => self.until_next_epoch(at.slot),
                    None => self.polling.epoch_duration(),
                }
            }
        };
        Ok(delay)
    }

    /// Retry within the same epoch.
    fn retry_delay(&self) -> Duration {
        self.polling.slot_duration()
    }
}
