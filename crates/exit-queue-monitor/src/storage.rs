//! Persistence of observed records.
//!
//! Uniqueness constraints in the database are the only deduplication
//! mechanism: writing a record whose natural key already exists is a no-op
//! reported as [`WriteOutcome::Ignored`], never an error.

use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use exit_queue_types::{
    CredentialsSample, ExitQueueSnapshot, PartialWithdrawalRecord, VoluntaryExitRecord,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

use crate::error::Result;

/// Result of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new row was written.
    Inserted,
    /// A row with the same natural key already existed.
    Ignored,
}

impl WriteOutcome {
    fn from_changes(changes: usize) -> Self {
        if changes == 0 {
            Self::Ignored
        } else {
            Self::Inserted
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// New rows written by [`Store::persist_block`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockWrites {
    pub exits_inserted: usize,
    pub withdrawals_inserted: usize,
}

/// Persistence capability used by the reconcilers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a voluntary exit unless `(validator_index, signature)` exists.
    async fn upsert_voluntary_exit(&self, record: &VoluntaryExitRecord) -> Result<WriteOutcome>;

    /// Insert a partial withdrawal unless `transaction_hash` exists.
    async fn upsert_partial_withdrawal(
        &self,
        record: &PartialWithdrawalRecord,
    ) -> Result<WriteOutcome>;

    /// Append an exit-queue snapshot.
    async fn insert_exit_queue_snapshot(&self, snapshot: &ExitQueueSnapshot) -> Result<()>;

    /// Write everything derived from one block: exits, then withdrawals,
    /// then the snapshot if any. Either every row is written or none is.
    async fn persist_block(
        &self,
        exits: &[VoluntaryExitRecord],
        withdrawals: &[PartialWithdrawalRecord],
        snapshot: Option<&ExitQueueSnapshot>,
    ) -> Result<BlockWrites>;

    /// Insert a credentials sample unless its epoch exists.
    async fn upsert_credentials_sample(&self, sample: &CredentialsSample) -> Result<WriteOutcome>;

    /// Highest epoch with a credentials sample.
    async fn latest_credentials_epoch(&self) -> Result<Option<u64>>;

    /// Highest slot at which any exit, withdrawal or snapshot was observed.
    async fn latest_observed_slot(&self) -> Result<Option<u64>>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS voluntary_exits (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        validator_index INTEGER NOT NULL,
        exit_epoch INTEGER NOT NULL,
        withdrawable_epoch INTEGER NOT NULL,
        balance INTEGER NOT NULL,
        effective_balance INTEGER NOT NULL,
        pubkey TEXT NOT NULL,
        signature TEXT NOT NULL,
        slot INTEGER NOT NULL,
        epoch INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (validator_index, signature)
    );
    CREATE INDEX IF NOT EXISTS idx_voluntary_exits_validator_index ON voluntary_exits (validator_index);
    CREATE INDEX IF NOT EXISTS idx_voluntary_exits_exit_epoch ON voluntary_exits (exit_epoch);
    CREATE INDEX IF NOT EXISTS idx_voluntary_exits_slot ON voluntary_exits (slot);
    CREATE INDEX IF NOT EXISTS idx_voluntary_exits_epoch ON voluntary_exits (epoch);

    CREATE TABLE IF NOT EXISTS partial_withdrawals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        validator_index INTEGER NOT NULL,
        exit_epoch INTEGER NOT NULL,
        balance INTEGER NOT NULL,
        effective_balance INTEGER NOT NULL,
        pubkey TEXT NOT NULL,
        recipient_address TEXT NOT NULL,
        amount INTEGER NOT NULL,
        fee INTEGER NOT NULL,
        block_number INTEGER NOT NULL,
        transaction_hash TEXT NOT NULL UNIQUE,
        slot INTEGER NOT NULL,
        epoch INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_partial_withdrawals_validator_index ON partial_withdrawals (validator_index);
    CREATE INDEX IF NOT EXISTS idx_partial_withdrawals_block_number ON partial_withdrawals (block_number);
    CREATE INDEX IF NOT EXISTS idx_partial_withdrawals_slot ON partial_withdrawals (slot);
    CREATE INDEX IF NOT EXISTS idx_partial_withdrawals_epoch ON partial_withdrawals (epoch);

    CREATE TABLE IF NOT EXISTS exit_queue_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slot INTEGER NOT NULL,
        epoch INTEGER NOT NULL,
        validators_in_queue INTEGER NOT NULL,
        earliest_exit_epoch INTEGER NOT NULL,
        earliest_withdrawable_epoch INTEGER NOT NULL,
        latest_exit_epoch INTEGER NOT NULL,
        latest_withdrawable_epoch INTEGER NOT NULL,
        first_validator_index INTEGER NOT NULL,
        first_validator_pubkey TEXT NOT NULL,
        last_validator_index INTEGER NOT NULL,
        last_validator_pubkey TEXT NOT NULL,
        balance_in_queue INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    CREATE INDEX IF NOT EXISTS idx_exit_queue_snapshots_slot ON exit_queue_snapshots (slot);
    CREATE INDEX IF NOT EXISTS idx_exit_queue_snapshots_epoch ON exit_queue_snapshots (epoch);
    CREATE INDEX IF NOT EXISTS idx_exit_queue_snapshots_exit_epochs
        ON exit_queue_snapshots (earliest_exit_epoch, latest_exit_epoch);

    CREATE TABLE IF NOT EXISTS withdrawal_credentials_samples (
        epoch INTEGER PRIMARY KEY,
        slot INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        count_type1 INTEGER NOT NULL,
        count_type2 INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_withdrawal_credentials_samples_slot
        ON withdrawal_credentials_samples (slot);
"#;

/// SQLite keeps signed 64-bit integers; store the bit pattern so that
/// `FAR_FUTURE_EPOCH` survives a round trip.
fn to_sql(value: u64) -> i64 {
    value as i64
}

fn from_sql(value: i64) -> u64 {
    value as u64
}

fn column(row: &Row<'_>, index: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(index).map(from_sql)
}

/// Parse a hex column written by this store.
fn hex_column<T: std::str::FromStr>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let text: String = row.get(index)?;
    text.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("invalid hex value '{text}'").into(),
        )
    })
}

fn insert_voluntary_exit(conn: &Connection, record: &VoluntaryExitRecord) -> Result<WriteOutcome> {
    let changes = conn.execute(
        "INSERT INTO voluntary_exits
            (validator_index, exit_epoch, withdrawable_epoch, balance, effective_balance,
             pubkey, signature, slot, epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (validator_index, signature) DO NOTHING",
        params![
            to_sql(record.validator_index),
            to_sql(record.exit_epoch),
            to_sql(record.withdrawable_epoch),
            to_sql(record.balance),
            to_sql(record.effective_balance),
            record.pubkey.to_string(),
            record.signature.to_string(),
            to_sql(record.observed_slot),
            to_sql(record.observed_epoch),
        ],
    )?;
    Ok(WriteOutcome::from_changes(changes))
}

fn insert_partial_withdrawal(
    conn: &Connection,
    record: &PartialWithdrawalRecord,
) -> Result<WriteOutcome> {
    let changes = conn.execute(
        "INSERT INTO partial_withdrawals
            (validator_index, exit_epoch, balance, effective_balance, pubkey,
             recipient_address, amount, fee, block_number, transaction_hash, slot, epoch)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT (transaction_hash) DO NOTHING",
        params![
            to_sql(record.validator_index),
            to_sql(record.exit_epoch),
            to_sql(record.balance),
            to_sql(record.effective_balance),
            record.pubkey.to_string(),
            record.recipient_address.to_string(),
            to_sql(record.amount),
            to_sql(record.fee),
            to_sql(record.block_number),
            record.transaction_hash,
            to_sql(record.observed_slot),
            to_sql(record.observed_epoch),
        ],
    )?;
    Ok(WriteOutcome::from_changes(changes))
}

fn insert_exit_queue_snapshot(conn: &Connection, snapshot: &ExitQueueSnapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO exit_queue_snapshots
            (slot, epoch, validators_in_queue, earliest_exit_epoch,
             earliest_withdrawable_epoch, latest_exit_epoch, latest_withdrawable_epoch,
             first_validator_index, first_validator_pubkey, last_validator_index,
             last_validator_pubkey, balance_in_queue)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            to_sql(snapshot.slot),
            to_sql(snapshot.epoch),
            to_sql(snapshot.validators_in_queue),
            to_sql(snapshot.earliest_exit_epoch),
            to_sql(snapshot.earliest_withdrawable_epoch),
            to_sql(snapshot.latest_exit_epoch),
            to_sql(snapshot.latest_withdrawable_epoch),
            to_sql(snapshot.first_validator_index),
            snapshot.first_validator_pubkey,
            to_sql(snapshot.last_validator_index),
            snapshot.last_validator_pubkey,
            to_sql(snapshot.balance_in_queue),
        ],
    )?;
    Ok(())
}

/// [`Store`] backed by a SQLite database.
///
/// rusqlite is synchronous, so every statement runs on tokio's blocking
/// thread pool and never stalls the runtime's worker threads.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let _: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init_schema(&conn)?;
        info!(path = %path.as_ref().display(), "Opened database");
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Run `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // An open transaction is rolled back when a panicking holder
            // unwinds, so a poisoned connection is still consistent.
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *conn)
        })
        .await?
    }

    /// Voluntary exits ordered by observation, optionally for one validator.
    pub async fn voluntary_exits(
        &self,
        validator_index: Option<u64>,
    ) -> Result<Vec<VoluntaryExitRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT validator_index, exit_epoch, withdrawable_epoch, balance,
                        effective_balance, pubkey, signature, slot, epoch
                 FROM voluntary_exits
                 WHERE ?1 IS NULL OR validator_index = ?1
                 ORDER BY slot, id",
            )?;
            let rows = stmt.query_map(params![validator_index.map(to_sql)], |row| {
                Ok(VoluntaryExitRecord {
                    validator_index: column(row, 0)?,
                    exit_epoch: column(row, 1)?,
                    withdrawable_epoch: column(row, 2)?,
                    balance: column(row, 3)?,
                    effective_balance: column(row, 4)?,
                    pubkey: hex_column(row, 5)?,
                    signature: hex_column(row, 6)?,
                    observed_slot: column(row, 7)?,
                    observed_epoch: column(row, 8)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    /// Partial withdrawals ordered by observation.
    pub async fn partial_withdrawals(&self) -> Result<Vec<PartialWithdrawalRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT validator_index, exit_epoch, balance, effective_balance, pubkey,
                        recipient_address, amount, fee, block_number, transaction_hash,
                        slot, epoch
                 FROM partial_withdrawals
                 ORDER BY slot, id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PartialWithdrawalRecord {
                    validator_index: column(row, 0)?,
                    exit_epoch: column(row, 1)?,
                    balance: column(row, 2)?,
                    effective_balance: column(row, 3)?,
                    pubkey: hex_column(row, 4)?,
                    recipient_address: hex_column(row, 5)?,
                    amount: column(row, 6)?,
                    fee: column(row, 7)?,
                    block_number: column(row, 8)?,
                    transaction_hash: row.get(9)?,
                    observed_slot: column(row, 10)?,
                    observed_epoch: column(row, 11)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    /// Most recent `limit` snapshots, newest first.
    pub async fn exit_queue_snapshots(&self, limit: usize) -> Result<Vec<ExitQueueSnapshot>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT slot, epoch, validators_in_queue, earliest_exit_epoch,
                        earliest_withdrawable_epoch, latest_exit_epoch, latest_withdrawable_epoch,
                        first_validator_index, first_validator_pubkey, last_validator_index,
                        last_validator_pubkey, balance_in_queue
                 FROM exit_queue_snapshots
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(ExitQueueSnapshot {
                    slot: column(row, 0)?,
                    epoch: column(row, 1)?,
                    validators_in_queue: column(row, 2)?,
                    earliest_exit_epoch: column(row, 3)?,
                    earliest_withdrawable_epoch: column(row, 4)?,
                    latest_exit_epoch: column(row, 5)?,
                    latest_withdrawable_epoch: column(row, 6)?,
                    first_validator_index: column(row, 7)?,
                    first_validator_pubkey: row.get(8)?,
                    last_validator_index: column(row, 9)?,
                    last_validator_pubkey: row.get(10)?,
                    balance_in_queue: column(row, 11)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }

    /// Credentials samples ordered by epoch.
    pub async fn credentials_samples(&self) -> Result<Vec<CredentialsSample>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT epoch, slot, timestamp, count_type1, count_type2
                 FROM withdrawal_credentials_samples
                 ORDER BY epoch",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CredentialsSample {
                    epoch: column(row, 0)?,
                    slot: column(row, 1)?,
                    timestamp: row.get(2)?,
                    count_type1: column(row, 3)?,
                    count_type2: column(row, 4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<_>>()?)
        })
        .await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_voluntary_exit(&self, record: &VoluntaryExitRecord) -> Result<WriteOutcome> {
        let record = record.clone();
        self.with_conn(move |conn| insert_voluntary_exit(conn, &record))
            .await
    }

    async fn upsert_partial_withdrawal(
        &self,
        record: &PartialWithdrawalRecord,
    ) -> Result<WriteOutcome> {
        let record = record.clone();
        self.with_conn(move |conn| insert_partial_withdrawal(conn, &record))
            .await
    }

    async fn insert_exit_queue_snapshot(&self, snapshot: &ExitQueueSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| insert_exit_queue_snapshot(conn, &snapshot))
            .await
    }

    async fn persist_block(
        &self,
        exits: &[VoluntaryExitRecord],
        withdrawals: &[PartialWithdrawalRecord],
        snapshot: Option<&ExitQueueSnapshot>,
    ) -> Result<BlockWrites> {
        let exits = exits.to_vec();
        let withdrawals = withdrawals.to_vec();
        let snapshot = snapshot.cloned();

        self.with_conn(move |conn| {
            // Dropping the transaction on an early return rolls it back.
            let tx = conn.transaction()?;
            let mut writes = BlockWrites::default();
            for record in &exits {
                if insert_voluntary_exit(&tx, record)?.is_inserted() {
                    writes.exits_inserted += 1;
                }
            }
            for record in &withdrawals {
                if insert_partial_withdrawal(&tx, record)?.is_inserted() {
                    writes.withdrawals_inserted += 1;
                }
            }
            if let Some(snapshot) = &snapshot {
                insert_exit_queue_snapshot(&tx, snapshot)?;
            }
            tx.commit()?;
            Ok(writes)
        })
        .await
    }

    async fn upsert_credentials_sample(&self, sample: &CredentialsSample) -> Result<WriteOutcome> {
        let sample = sample.clone();
        self.with_conn(move |conn| {
            let changes = conn.execute(
                "INSERT INTO withdrawal_credentials_samples
                    (epoch, slot, timestamp, count_type1, count_type2)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (epoch) DO NOTHING",
                params![
                    to_sql(sample.epoch),
                    to_sql(sample.slot),
                    sample.timestamp,
                    to_sql(sample.count_type1),
                    to_sql(sample.count_type2),
                ],
            )?;
            Ok(WriteOutcome::from_changes(changes))
        })
        .await
    }

    async fn latest_credentials_epoch(&self) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            let epoch: Option<i64> = conn
                .query_row(
                    "SELECT MAX(epoch) FROM withdrawal_credentials_samples",
                    [],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            Ok(epoch.map(from_sql))
        })
        .await
    }

    async fn latest_observed_slot(&self) -> Result<Option<u64>> {
        self.with_conn(|conn| {
            let slot: Option<i64> = conn.query_row(
                "SELECT MAX(slot) FROM (
                    SELECT MAX(slot) AS slot FROM voluntary_exits
                    UNION ALL SELECT MAX(slot) FROM partial_withdrawals
                    UNION ALL SELECT MAX(slot) FROM exit_queue_snapshots
                )",
                [],
                |row| row.get(0),
            )?;
            Ok(slot.map(from_sql))
        })
        .await
    }
}
