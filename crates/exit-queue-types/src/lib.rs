//! Record types shared by the exit-queue monitor and anything reading its
//! database.
//!
//! Every record here is an immutable observation: it is stamped with the
//! slot and epoch at which the monitor saw it and is never updated after it
//! has been written.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

use alloy_primitives::{Address, B256, FixedBytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of slots in one epoch.
pub const SLOTS_PER_EPOCH: u64 = 32;

/// Duration of one slot in seconds.
pub const SECONDS_PER_SLOT: u64 = 12;

/// Epoch value used by the consensus layer for "not scheduled".
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

/// BLS12-381 public key of a validator.
pub type BlsPublicKey = FixedBytes<48>;

/// BLS12-381 signature.
pub type BlsSignature = FixedBytes<96>;

/// Position on the chain at which something was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockPointer {
    pub slot: u64,
    pub epoch: u64,
}

impl BlockPointer {
    /// Pointer for `slot` using the mainnet epoch length.
    pub fn from_slot(slot: u64) -> Self {
        Self::with_epoch_length(slot, SLOTS_PER_EPOCH)
    }

    /// Pointer for `slot` with a custom epoch length.
    pub fn with_epoch_length(slot: u64, slots_per_epoch: u64) -> Self {
        Self {
            slot,
            epoch: slot / slots_per_epoch.max(1),
        }
    }

    pub fn is_even_epoch(&self) -> bool {
        self.epoch % 2 == 0
    }
}

/// A voluntary exit message seen in a block, enriched with the exiting
/// validator's state.
///
/// Natural key: `(validator_index, signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoluntaryExitRecord {
    pub validator_index: u64,
    pub exit_epoch: u64,
    pub withdrawable_epoch: u64,
    pub balance: u64,
    pub effective_balance: u64,
    pub pubkey: BlsPublicKey,
    pub signature: BlsSignature,
    pub observed_slot: u64,
    pub observed_epoch: u64,
}

/// A partial withdrawal request carried by a block's execution requests.
///
/// Natural key: `transaction_hash`. The consensus block does not carry the
/// hash of the transaction that raised the request, so the key is built by
/// [`PartialWithdrawalRecord::operation_key`] from the execution block hash
/// and the request's position in the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialWithdrawalRecord {
    pub validator_index: u64,
    pub exit_epoch: u64,
    pub balance: u64,
    pub effective_balance: u64,
    pub pubkey: BlsPublicKey,
    pub recipient_address: Address,
    /// Withdrawn amount in Gwei.
    pub amount: u64,
    /// Request fee in Gwei. The fee is paid to the request contract and is
    /// not carried by the block, so it is recorded as zero.
    pub fee: u64,
    pub block_number: u64,
    pub transaction_hash: String,
    pub observed_slot: u64,
    pub observed_epoch: u64,
}

impl PartialWithdrawalRecord {
    /// Builds the natural key of the `position`-th withdrawal request of
    /// execution block `block_hash`.
    pub fn operation_key(block_hash: &B256, position: usize) -> String {
        format!("{block_hash}:{position}")
    }
}

/// Summary of the active-exiting validator set at a point in time.
///
/// Append-only; several snapshots may share an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitQueueSnapshot {
    pub slot: u64,
    pub epoch: u64,
    pub validators_in_queue: u64,
    pub earliest_exit_epoch: u64,
    pub earliest_withdrawable_epoch: u64,
    pub latest_exit_epoch: u64,
    pub latest_withdrawable_epoch: u64,
    pub first_validator_index: u64,
    /// Hex-encoded pubkey, empty when the queue is empty.
    pub first_validator_pubkey: String,
    pub last_validator_index: u64,
    /// Hex-encoded pubkey, empty when the queue is empty.
    pub last_validator_pubkey: String,
    /// Sum of the queued validators' balances in Gwei.
    pub balance_in_queue: u64,
}

impl ExitQueueSnapshot {
    /// The zero-valued snapshot recorded when nobody is exiting.
    pub fn empty(at: BlockPointer) -> Self {
        Self {
            slot: at.slot,
            epoch: at.epoch,
            validators_in_queue: 0,
            earliest_exit_epoch: 0,
            earliest_withdrawable_epoch: 0,
            latest_exit_epoch: 0,
            latest_withdrawable_epoch: 0,
            first_validator_index: 0,
            first_validator_pubkey: String::new(),
            last_validator_index: 0,
            last_validator_pubkey: String::new(),
            balance_in_queue: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.validators_in_queue == 0
    }
}

/// Withdrawal-credential type counts over the active validator set.
///
/// One row per even epoch, first writer wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsSample {
    pub epoch: u64,
    pub slot: u64,
    pub timestamp: DateTime<Utc>,
    /// Validators with `0x01` execution credentials.
    pub count_type1: u64,
    /// Validators with `0x02` compounding credentials.
    pub count_type2: u64,
}
