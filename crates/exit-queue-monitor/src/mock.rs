// A scripted in-memory beacon node that can be used for unit tests.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use exit_queue_types::{BlsPublicKey, BlsSignature, FAR_FUTURE_EPOCH};

use crate::{
    api::{
        BeaconApi, BeaconBlock, BeaconBlockBody, Checkpoint, ExecutionPayload,
        ExecutionRequests, FinalityCheckpoints, Genesis, SignedVoluntaryExit, Validator,
        ValidatorId, ValidatorState, ValidatorStatus, VoluntaryExit, WithdrawalRequest,
    },
    error::{Error, Result},
};

fn unavailable() -> Error {
    Error::Api {
        status: 503,
        message: "mock beacon unavailable".to_string(),
    }
}

#[derive(Default)]
struct State {
    head_slot: u64,
    blocks: HashMap<u64, BeaconBlock>,
    validators: Vec<ValidatorState>,
    fail_head: usize,
    fail_blocks: usize,
    fail_validators: usize,
    fail_exiting_scans: usize,
    validator_queries: Vec<(Option<ValidatorStatus>, Option<Vec<ValidatorId>>)>,
}

pub(crate) struct MockBeacon {
    state: Mutex<State>,
    head_calls: AtomicUsize,
    block_calls: AtomicUsize,
}

impl MockBeacon {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            head_calls: AtomicUsize::new(0),
            block_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_head(&self, slot: u64) {
        self.state.lock().unwrap().head_slot = slot;
    }

    pub(crate) fn insert_block(&self, block: BeaconBlock) {
        self.state.lock().unwrap().blocks.insert(block.slot, block);
    }

    pub(crate) fn set_validators(&self, validators: Vec<ValidatorState>) {
        self.state.lock().unwrap().validators = validators;
    }

    pub(crate) fn fail_next_head(&self) {
        self.state.lock().unwrap().fail_head += 1;
    }

    pub(crate) fn fail_next_block(&self) {
        self.state.lock().unwrap().fail_blocks += 1;
    }

    pub(crate) fn fail_next_validators(&self) {
        self.state.lock().unwrap().fail_validators += 1;
    }

    /// Fail the next query filtered on `active_exiting` only.
    pub(crate) fn fail_next_exiting_scan(&self) {
        self.state.lock().unwrap().fail_exiting_scans += 1;
    }

    pub(crate) fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    /// Every `get_validators` call as `(status, ids)`.
    pub(crate) fn validator_queries(
        &self,
    ) -> Vec<(Option<ValidatorStatus>, Option<Vec<ValidatorId>>)> {
        self.state.lock().unwrap().validator_queries.clone()
    }
}

#[async_trait]
impl BeaconApi for MockBeacon {
    async fn get_head_block(&self) -> Result<BeaconBlock> {
        self.head_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_head > 0 {
            state.fail_head -= 1;
            return Err(unavailable());
        }
        let slot = state.head_slot;
        Ok(state
            .blocks
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| block(slot, vec![], vec![])))
    }

    async fn get_block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.fail_blocks > 0 {
            state.fail_blocks -= 1;
            return Err(unavailable());
        }
        Ok(Some(
            state
                .blocks
                .get(&slot)
                .cloned()
                .unwrap_or_else(|| block(slot, vec![], vec![])),
        ))
    }

    async fn get_validators(
        &self,
        status: Option<ValidatorStatus>,
        ids: Option<&[ValidatorId]>,
    ) -> Result<Vec<ValidatorState>> {
        let mut state = self.state.lock().unwrap();
        state
            .validator_queries
            .push((status, ids.map(|ids| ids.to_vec())));
        if state.fail_validators > 0 {
            state.fail_validators -= 1;
            return Err(unavailable());
        }
        if status == Some(ValidatorStatus::ActiveExiting) && state.fail_exiting_scans > 0 {
            state.fail_exiting_scans -= 1;
            return Err(unavailable());
        }
        Ok(state
            .validators
            .iter()
            .filter(|v| status.is_none_or(|status| v.status == status))
            .filter(|v| {
                ids.is_none_or(|ids| {
                    ids.contains(&ValidatorId::Index(v.index))
                        || ids.contains(&ValidatorId::Pubkey(v.validator.pubkey))
                })
            })
            .cloned()
            .collect())
    }

    async fn get_validator(&self, index: u64) -> Result<Option<ValidatorState>> {
        let state = self.state.lock().unwrap();
        Ok(state.validators.iter().find(|v| v.index == index).cloned())
    }

    async fn get_genesis(&self) -> Result<Genesis> {
        Ok(Genesis {
            genesis_time: 1_606_824_023,
            genesis_validators_root: B256::ZERO,
            genesis_fork_version: Default::default(),
        })
    }

    async fn get_finality_checkpoints(&self) -> Result<FinalityCheckpoints> {
        let state = self.state.lock().unwrap();
        let epoch = (state.head_slot / 32).saturating_sub(2);
        let checkpoint = Checkpoint {
            epoch,
            root: B256::ZERO,
        };
        Ok(FinalityCheckpoints {
            previous_justified: checkpoint,
            current_justified: checkpoint,
            finalized: checkpoint,
        })
    }
}

/// Post-Electra block at `slot` with the given exits and withdrawal requests.
pub(crate) fn block(
    slot: u64,
    voluntary_exits: Vec<SignedVoluntaryExit>,
    withdrawal_requests: Vec<WithdrawalRequest>,
) -> BeaconBlock {
    BeaconBlock {
        slot,
        proposer_index: 0,
        body: BeaconBlockBody {
            voluntary_exits,
            execution_payload: Some(ExecutionPayload {
                block_number: 1_000 + slot,
                block_hash: B256::with_last_byte(slot as u8),
            }),
            execution_requests: Some(ExecutionRequests {
                withdrawals: withdrawal_requests,
            }),
        },
    }
}

pub(crate) fn exit_message(validator_index: u64, epoch: u64, signature_byte: u8) -> SignedVoluntaryExit {
    SignedVoluntaryExit {
        message: VoluntaryExit {
            epoch,
            validator_index,
        },
        signature: BlsSignature::repeat_byte(signature_byte),
    }
}

/// Withdrawal request for the validator built by [`validator`] with `index`.
pub(crate) fn withdrawal_request(validator_index: u64, amount: u64) -> WithdrawalRequest {
    WithdrawalRequest {
        source_address: Address::repeat_byte(0x22),
        validator_pubkey: pubkey(validator_index),
        amount,
    }
}

pub(crate) fn pubkey(validator_index: u64) -> BlsPublicKey {
    BlsPublicKey::with_last_byte(validator_index as u8)
}

/// Active validator with `0x01` credentials and no exit scheduled.
pub(crate) fn validator(index: u64, status: ValidatorStatus) -> ValidatorState {
    ValidatorState {
        index,
        balance: 32_000_000_000,
        status,
        validator: Validator {
            pubkey: pubkey(index),
            withdrawal_credentials: credentials(0x01),
            effective_balance: 32_000_000_000,
            slashed: false,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        },
    }
}

/// Validator in the exit queue.
pub(crate) fn exiting_validator(index: u64, exit_epoch: u64, balance: u64) -> ValidatorState {
    let mut state = validator(index, ValidatorStatus::ActiveExiting);
    state.balance = balance;
    state.validator.exit_epoch = exit_epoch;
    state.validator.withdrawable_epoch = exit_epoch + 256;
    state
}

pub(crate) fn credentials(prefix: u8) -> B256 {
    let mut credentials = B256::repeat_byte(0x33);
    credentials[0] = prefix;
    credentials
}
