//! Exit-queue monitor daemon.
//!
//! Runs two pollers against one beacon node until SIGINT/SIGTERM:
//!
//! 1. Every slot, reconcile the head block: record its voluntary exits and
//!    partial withdrawals, and snapshot the exit queue when it changed
//! 2. Every even epoch, record the withdrawal credential type counts of the
//!    active validator set
//!
//! ## Architecture
//!
//! ```text
//!   Beacon node        Exit queue poller     Credentials sampler      SQLite
//!       |                     |                      |                   |
//!       |<----head block------|                      |                   |
//!       |<--block + lookup----|                      |                   |
//!       |---------------------|--exits, withdrawals, snapshot----------->|
//!       |                     |                      |                   |
//!       |<----------------active_ongoing set---------|                   |
//!       |                     |                      |------sample------>|
//!       |                     |                      |                   |
//! ```
//!
//! A poller that hits a non-transient error stops the whole process with a
//! non-zero exit code so a supervisor can restart it.

use std::{path::PathBuf, sync::Arc};

use anyhow::bail;
use clap::Parser;
use exit_queue_monitor::{
    BeaconApi, BeaconClient, Config, SharedProgressCache, SqliteStore, Store,
    service::{
        PollingScheduler, credentials::ValidatorCredentialsSampler, exit_queue::ExitQueuePoller,
    },
};
use futures::future::select_all;
use tokio::{
    signal::unix::{SignalKind, signal},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "exit-queue-monitor")]
#[command(about = "Record validator exits, withdrawals and exit-queue state from a beacon node")]
struct Cli {
    /// Optional TOML file with tuning settings.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Beacon node REST endpoint.
    #[arg(long, env = "BEACON_API_URL")]
    beacon_api_url: Option<Url>,

    /// SQLite database file.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<PathBuf>,
}

impl Cli {
    /// Load the config file, if any, and apply CLI/environment overrides.
    fn resolve_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(url) = &self.beacon_api_url {
            config.beacon_api_url = Some(url.clone());
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.resolve_config()?;
    let url = config.validate()?.clone();

    info!(database = %config.database.path.display(), "Loaded configuration");

    // Probe the beacon node.

    let client = BeaconClient::new(url, &config.beacon)?;
    info!(
        beacon_api_url = %client.url(),
        max_requests_per_period = config.beacon.max_requests_per_period,
        rate_limit_period_ms = config.beacon.rate_limit_period_ms,
        "Created beacon client"
    );
    let beacon: Arc<dyn BeaconApi> = Arc::new(client);

    match beacon.get_genesis().await {
        Ok(genesis) => info!(
            genesis_time = genesis.genesis_time,
            genesis_fork_version = %genesis.genesis_fork_version,
            "Connected to beacon node"
        ),
        Err(e) => bail!("Failed to get genesis from beacon node: {e}"),
    }

    match beacon.get_finality_checkpoints().await {
        Ok(checkpoints) => info!(
            finalized_epoch = checkpoints.finalized.epoch,
            justified_epoch = checkpoints.current_justified.epoch,
            "Finality checkpoints"
        ),
        Err(e) => warn!(error = %e, "Failed to get finality checkpoints"),
    }

    // Open the store.

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.database.path)?);

    let cache = Arc::new(SharedProgressCache::new(
        config.polling.head_cache_ttl(),
        config.polling.slots_per_epoch,
    ));

    // Processing restarts at the head, so anything produced while we were
    // down is skipped.
    match (store.latest_observed_slot().await?, cache.resolve(beacon.as_ref()).await) {
        (Some(last_slot), Ok(head)) if head.slot > last_slot => warn!(
            last_observed_slot = last_slot,
            head_slot = head.slot,
            skipped_slots = head.slot - last_slot - 1,
            "Resuming at head, slots since last observation are not processed"
        ),
        (_, Err(e)) => warn!(error = %e, "Failed to get head block"),
        _ => {}
    }

    let shutdown_token = CancellationToken::new();
    let scheduler = PollingScheduler::new(shutdown_token.clone());
    let mut tasks = JoinSet::new();

    // Start exit queue poller.

    {
        let poller = ExitQueuePoller::new(
            beacon.clone(),
            store.clone(),
            cache.clone(),
            config.polling.slot_duration(),
        );
        let scheduler = scheduler.clone();

        tasks.spawn(
            async move { scheduler.run(poller).await }
                .instrument(info_span!("poller", service = "exit_queue")),
        );
    }

    // Start credentials sampler.

    {
        let sampler =
            ValidatorCredentialsSampler::new(beacon, store, cache, config.polling).await?;
        let scheduler = scheduler.clone();

        tasks.spawn(
            async move { scheduler.run(sampler).await }
                .instrument(info_span!("poller", service = "credentials")),
        );
    }

    info!("All services started, waiting for shutdown signal");

    let mut signals: Vec<_> = [SignalKind::interrupt(), SignalKind::terminate()]
        .into_iter()
        .filter_map(|kind| signal(kind).ok())
        .collect();

    if signals.is_empty() {
        bail!("No shutdown signals could be registered");
    }

    let mut failed = false;

    tokio::select! {
        _ = select_all(signals.iter_mut().map(|s| Box::pin(s.recv()))) => {
            info!("Received shutdown signal, shutting down");
        }

        Some(joined) = tasks.join_next() => {
            failed |= !stopped_cleanly(joined);
            warn!("A service stopped, shutting down");
        }
    }

    shutdown_token.cancel();

    while let Some(joined) = tasks.join_next().await {
        failed |= !stopped_cleanly(joined);
    }

    if failed {
        bail!("A service stopped with an error");
    }

    info!("All services stopped, exiting");

    Ok(())
}

fn stopped_cleanly(joined: Result<exit_queue_monitor::Result<()>, JoinError>) -> bool {
    match joined {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(error = %e, "Service failed");
            false
        }
        Err(e) => {
            error!(error = %e, "Service panicked");
            false
        }
    }
}
