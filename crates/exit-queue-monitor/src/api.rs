//! Beacon node capability consumed by the monitor, and the subset of the
//! consensus-layer JSON types it reads.
//!
//! All state queries are answered against the node's `head` state.

use std::fmt;

use alloy_primitives::{Address, B256, FixedBytes};
use async_trait::async_trait;
use exit_queue_types::{BlsPublicKey, BlsSignature};
use serde::Deserialize;
use strum::{AsRefStr, Display, EnumString};

use crate::error::Result;

/// Read-only access to a beacon node.
#[async_trait]
pub trait BeaconApi: Send + Sync {
    /// Fetch the current head block.
    async fn get_head_block(&self) -> Result<BeaconBlock>;

    /// Fetch the block proposed at `slot`. Returns `None` for an empty slot.
    async fn get_block(&self, slot: u64) -> Result<Option<BeaconBlock>>;

    /// Fetch validators, optionally filtered by status and/or identity.
    ///
    /// `ids = Some(&[])` matches nothing and must not widen to the full set.
    async fn get_validators(
        &self,
        status: Option<ValidatorStatus>,
        ids: Option<&[ValidatorId]>,
    ) -> Result<Vec<ValidatorState>>;

    /// Fetch a single validator. Returns `None` if the index is unknown.
    async fn get_validator(&self, index: u64) -> Result<Option<ValidatorState>>;

    /// Fetch chain genesis information.
    async fn get_genesis(&self) -> Result<Genesis>;

    /// Fetch the justified and finalized checkpoints of the head state.
    async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints>;
}

/// Standard `{"data": ...}` envelope of the beacon API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Signed block as returned by `/eth/v2/beacon/blocks/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
}

/// Beacon block (only the fields the monitor reads).
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconBlock {
    #[serde(with = "serde_utils::quoted_u64")]
    pub slot: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub body: BeaconBlockBody,
}

/// Block body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeaconBlockBody {
    #[serde(default)]
    pub voluntary_exits: Vec<SignedVoluntaryExit>,
    /// Absent before the merge.
    #[serde(default)]
    pub execution_payload: Option<ExecutionPayload>,
    /// Absent before Electra.
    #[serde(default)]
    pub execution_requests: Option<ExecutionRequests>,
}

impl BeaconBlockBody {
    /// Withdrawal requests included in the block, empty before Electra.
    pub fn withdrawal_requests(&self) -> &[WithdrawalRequest] {
        self.execution_requests
            .as_ref()
            .map(|requests| requests.withdrawals.as_slice())
            .unwrap_or_default()
    }
}

/// Signed voluntary exit.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: BlsSignature,
}

/// Voluntary exit message.
#[derive(Debug, Clone, Deserialize)]
pub struct VoluntaryExit {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
}

/// Execution payload (minimal fields).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionPayload {
    #[serde(with = "serde_utils::quoted_u64")]
    pub block_number: u64,
    pub block_hash: B256,
}

/// Requests raised on the execution layer and carried by the block (EIP-7685).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionRequests {
    #[serde(default)]
    pub withdrawals: Vec<WithdrawalRequest>,
}

/// Withdrawal triggered from a validator's execution address (EIP-7002).
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRequest {
    /// Execution address that sent the request, the validator's withdrawal
    /// address.
    pub source_address: Address,
    pub validator_pubkey: BlsPublicKey,
    /// Requested amount in Gwei. Zero requests a full exit.
    #[serde(with = "serde_utils::quoted_u64")]
    pub amount: u64,
}

impl WithdrawalRequest {
    pub fn is_partial(&self) -> bool {
        self.amount > 0
    }
}

/// Validator identifier accepted by the `id` filter of state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidatorId {
    Index(u64),
    Pubkey(BlsPublicKey),
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Pubkey(pubkey) => write!(f, "{pubkey}"),
        }
    }
}

/// Validator lifecycle status as reported by the beacon API.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ValidatorStatus {
    PendingInitialized,
    PendingQueued,
    ActiveOngoing,
    ActiveExiting,
    ActiveSlashed,
    ExitedUnslashed,
    ExitedSlashed,
    WithdrawalPossible,
    WithdrawalDone,
}

/// Validator entry of `/eth/v1/beacon/states/{state}/validators`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorState {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    /// Current balance in Gwei.
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: u64,
    pub status: ValidatorStatus,
    pub validator: Validator,
}

/// Validator registry record.
#[derive(Debug, Clone, Deserialize)]
pub struct Validator {
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: B256,
    #[serde(with = "serde_utils::quoted_u64")]
    pub effective_balance: u64,
    pub slashed: bool,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_eligibility_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub activation_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub exit_epoch: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub withdrawable_epoch: u64,
}

/// Genesis information.
#[derive(Debug, Clone, Deserialize)]
pub struct Genesis {
    #[serde(with = "serde_utils::quoted_u64")]
    pub genesis_time: u64,
    pub genesis_validators_root: B256,
    pub genesis_fork_version: FixedBytes<4>,
}

/// Checkpoint (epoch + block root).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Checkpoint {
    #[serde(with = "serde_utils::quoted_u64")]
    pub epoch: u64,
    pub root: B256,
}

/// Finality checkpoints of a state.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FinalityCheckpoints {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}
