//! Long-running pollers of the exit-queue monitor.
//!
//! # Architecture Overview
//!
//! Two independent pollers run side by side. The only state they share is
//! the [`SharedProgressCache`](crate::SharedProgressCache) holding the
//! current head.
//!
//! ```text
//!                        ┌──────────────────────────┐
//!                        │       Beacon node        │
//!                        └──────────────────────────┘
//!                          ▲          ▲           ▲
//!                          │          │           │
//!                     Head block  Block + batch  active_ongoing
//!                          │     validator lookup  validators
//!                          │          │           │
//!               ┌──────────┴────────┐ │           │
//!               │ SharedProgressCache│ │           │
//!               └──────────┬────────┘ │           │
//!                   ▲      │          │           │
//!            (epoch, slot) │          │           │
//!                   │      ▼          │           │
//!        ┌──────────┴──────────────┐  │  ┌────────┴──────────────────┐
//!        │   Exit queue poller     ├──┘  │ Credentials sampler       │
//!        │ (every slot)            │     │ (even epochs only)        │
//!        └──────────┬──────────────┘     └────────┬──────────────────┘
//!                   │                             │
//!      exits, withdrawals, snapshots       credentials samples
//!                   │                             │
//!                   ▼                             ▼
//!        ┌───────────────────────────────────────────────────────────┐
//!        │                          Store                            │
//!        └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Services
//!
//! - [`exit_queue::ExitQueuePoller`]: processes each new head slot with an
//!   [`exit_queue::ExitQueueReconciler`]
//! - [`credentials::ValidatorCredentialsSampler`]: tallies withdrawal
//!   credential types once per even epoch
//! - [`PollingScheduler`]: runs a [`Poller`] until shutdown or a fatal error

use std::time::Duration;

use async_trait::async_trait;
use exit_queue_types::BlockPointer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;

pub mod credentials;
pub mod exit_queue;

/// A component that does one unit of work per tick.
#[async_trait]
pub trait Poller: Send {
    fn name(&self) -> &'static str;

    /// Run one tick and return how long to wait before the next one.
    async fn tick(&mut self) -> Result<Duration>;

    /// How long to wait after a tick failed with a transient error.
    fn retry_delay(&self) -> Duration;
}

/// Drives a [`Poller`] in a loop.
///
/// Transient errors are logged and the tick is retried after
/// [`Poller::retry_delay`]. Any other error ends the loop and is returned.
/// Shutdown is only observed between ticks.
#[derive(Clone)]
pub struct PollingScheduler {
    shutdown_token: CancellationToken,
}

impl PollingScheduler {
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self { shutdown_token }
    }

    pub async fn run<P: Poller>(&self, mut poller: P) -> Result<()> {
        let name = poller.name();
        info!(poller = name, "Poller started");

        while !self.shutdown_token.is_cancelled() {
            let delay = match poller.tick().await {
                Ok(delay) => delay,
                Err(e) if e.is_transient() => {
                    warn!(poller = name, error = %e, "Tick failed, retrying later");
                    poller.retry_delay()
                }
                Err(e) => {
                    error!(poller = name, error = %e, "Poller failed");
                    return Err(e);
                }
            };

            tokio::select! {
                biased;

                _ = self.shutdown_token.cancelled() => {
                    info!(poller = name, "Poller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(poller = name, "Poller stopped");
        Ok(())
    }
}

/// Highest block fully processed by one poller since process start.
///
/// Kept in memory only. The store's uniqueness constraints, not this
/// watermark, keep records from being written twice.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressWatermark {
    last_processed: Option<BlockPointer>,
}

impl ProgressWatermark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_processed(&self) -> Option<BlockPointer> {
        self.last_processed
    }

    /// Whether `at` is at or behind the watermark.
    pub fn covers(&self, at: BlockPointer) -> bool {
        self.last_processed.is_some_and(|last| at.slot <= last.slot)
    }

    /// Move the watermark to `at`. Never moves backwards.
    pub fn advance(&mut self, at: BlockPointer) {
        if !self.covers(at) {
            self.last_processed = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use exit_queue_types::BlockPointer;
    use tokio_util::sync::CancellationToken;

    use super::{Poller, PollingScheduler, ProgressWatermark};
    use crate::error::{Error, Result};

    struct ScriptedPoller {
        ticks: Arc<AtomicUsize>,
        script: Vec<Result<Duration>>,
    }

    #[async_trait]
    impl Poller for ScriptedPoller {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn tick(&mut self) -> Result<Duration> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.script.is_empty() {
                Ok(Duration::from_secs(12))
            } else {
                self.script.remove(0)
            }
        }

        fn retry_delay(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn transient() -> Error {
        Error::Api {
            status: 503,
            message: "unavailable".to_string(),
        }
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let mut watermark = ProgressWatermark::new();
        assert!(!watermark.covers(BlockPointer::from_slot(0)));

        watermark.advance(BlockPointer::from_slot(100));
        watermark.advance(BlockPointer::from_slot(90));
        assert_eq!(watermark.last_processed(), Some(BlockPointer::from_slot(100)));
        assert!(watermark.covers(BlockPointer::from_slot(100)));
        assert!(watermark.covers(BlockPointer::from_slot(99)));
        assert!(!watermark.covers(BlockPointer::from_slot(101)));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_stop_the_poller() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let scheduler = PollingScheduler::new(shutdown.clone());
        let poller = ScriptedPoller {
            ticks: ticks.clone(),
            script: vec![Err(transient()), Err(transient())],
        };

        let task = tokio::spawn(async move { scheduler.run(poller).await });
        tokio::time::sleep(Duration::from_secs(30)).await;
        shutdown.cancel();

        assert!(task.await.unwrap().is_ok());
        // Two retries after 1s each, then ticks every 12s.
        assert_eq!(ticks.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_ends_the_poller() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let scheduler = PollingScheduler::new(CancellationToken::new());
        let poller = ScriptedPoller {
            ticks: ticks.clone(),
            script: vec![
                Ok(Duration::from_secs(12)),
                Err(Error::Config("broken".to_string())),
            ],
        };

        let result = scheduler.run(poller).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_scheduler_does_not_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let poller = ScriptedPoller {
            ticks: ticks.clone(),
            script: vec![],
        };

        PollingScheduler::new(shutdown).run(poller).await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
