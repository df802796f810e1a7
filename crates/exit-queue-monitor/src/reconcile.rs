//! Pure helpers that turn beacon data into persisted records.
//!
//! Nothing here talks to the network or the database, so the reconcilers
//! can fetch everything first and only then build and write records.

use std::collections::HashMap;

use alloy_primitives::B256;
use exit_queue_types::{
    BlockPointer, BlsPublicKey, ExitQueueSnapshot, PartialWithdrawalRecord, VoluntaryExitRecord,
};
use tracing::{debug, warn};

use crate::api::{
    BeaconBlockBody, ExecutionPayload, SignedVoluntaryExit, ValidatorId, ValidatorState,
    WithdrawalRequest,
};

/// Validators referenced by a block's exits and partial withdrawal requests,
/// sorted and deduplicated so they fit one batched lookup.
///
/// Exits name their validator by index, requests by pubkey.
pub fn referenced_validators(body: &BeaconBlockBody) -> Vec<ValidatorId> {
    let mut ids: Vec<ValidatorId> = body
        .voluntary_exits
        .iter()
        .map(|exit| ValidatorId::Index(exit.message.validator_index))
        .chain(
            body.withdrawal_requests()
                .iter()
                .filter(|request| request.is_partial())
                .map(|request| ValidatorId::Pubkey(request.validator_pubkey)),
        )
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Index a batch lookup response by validator index.
pub fn index_validators(validators: Vec<ValidatorState>) -> HashMap<u64, ValidatorState> {
    validators.into_iter().map(|v| (v.index, v)).collect()
}

/// Join exit messages with the validator states of a batch lookup.
///
/// Messages whose validator is absent from `validators` are dropped.
pub fn exit_records(
    at: BlockPointer,
    exits: &[SignedVoluntaryExit],
    validators: &HashMap<u64, ValidatorState>,
) -> Vec<VoluntaryExitRecord> {
    exits
        .iter()
        .filter_map(|exit| {
            let index = exit.message.validator_index;
            let Some(state) = validators.get(&index) else {
                warn!(
                    slot = at.slot,
                    validator_index = index,
                    "Exiting validator missing from batch lookup, dropping exit"
                );
                return None;
            };
            Some(VoluntaryExitRecord {
                validator_index: index,
                exit_epoch: state.validator.exit_epoch,
                withdrawable_epoch: state.validator.withdrawable_epoch,
                balance: state.balance,
                effective_balance: state.validator.effective_balance,
                pubkey: state.validator.pubkey,
                signature: exit.signature,
                observed_slot: at.slot,
                observed_epoch: at.epoch,
            })
        })
        .collect()
}

/// Join the partial withdrawal requests of a block with the validator states
/// of a batch lookup, matching on pubkey.
///
/// Requests for a zero amount are full exits and are skipped. Requests whose
/// validator is absent from `validators` are dropped.
pub fn partial_withdrawal_records(
    at: BlockPointer,
    payload: &ExecutionPayload,
    requests: &[WithdrawalRequest],
    validators: &HashMap<u64, ValidatorState>,
) -> Vec<PartialWithdrawalRecord> {
    let by_pubkey: HashMap<&BlsPublicKey, &ValidatorState> = validators
        .values()
        .map(|state| (&state.validator.pubkey, state))
        .collect();

    requests
        .iter()
        .enumerate()
        .filter_map(|(position, request)| {
            if !request.is_partial() {
                debug!(
                    slot = at.slot,
                    pubkey = %request.validator_pubkey,
                    "Full exit request, skipping"
                );
                return None;
            }
            let Some(state) = by_pubkey.get(&request.validator_pubkey) else {
                warn!(
                    slot = at.slot,
                    pubkey = %request.validator_pubkey,
                    "Requesting validator missing from batch lookup, dropping withdrawal"
                );
                return None;
            };
            Some(PartialWithdrawalRecord {
                validator_index: state.index,
                exit_epoch: state.validator.exit_epoch,
                balance: state.balance,
                effective_balance: state.validator.effective_balance,
                pubkey: state.validator.pubkey,
                recipient_address: request.source_address,
                amount: request.amount,
                fee: 0,
                block_number: payload.block_number,
                transaction_hash: PartialWithdrawalRecord::operation_key(
                    &payload.block_hash,
                    position,
                ),
                observed_slot: at.slot,
                observed_epoch: at.epoch,
            })
        })
        .collect()
}

/// Summarize the active-exiting validator set.
///
/// Validators are ordered by `(exit_epoch, index)`; the first is the
/// earliest and the last is the latest. An empty set yields
/// [`ExitQueueSnapshot::empty`].
pub fn summarize_exit_queue(
    at: BlockPointer,
    mut exiting: Vec<ValidatorState>,
) -> ExitQueueSnapshot {
    exiting.sort_by_key(|v| (v.validator.exit_epoch, v.index));

    let (Some(first), Some(last)) = (exiting.first(), exiting.last()) else {
        return ExitQueueSnapshot::empty(at);
    };

    ExitQueueSnapshot {
        slot: at.slot,
        epoch: at.epoch,
        validators_in_queue: exiting.len() as u64,
        earliest_exit_epoch: first.validator.exit_epoch,
        earliest_withdrawable_epoch: first.validator.withdrawable_epoch,
        latest_exit_epoch: last.validator.exit_epoch,
        latest_withdrawable_epoch: last.validator.withdrawable_epoch,
        first_validator_index: first.index,
        first_validator_pubkey: first.validator.pubkey.to_string(),
        last_validator_index: last.index,
        last_validator_pubkey: last.validator.pubkey.to_string(),
        balance_in_queue: exiting
            .iter()
            .fold(0u64, |sum, v| sum.saturating_add(v.balance)),
    }
}

/// Withdrawal credential type, read from the first byte of the credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// `0x00`: BLS withdrawal key.
    Bls,
    /// `0x01`: execution address.
    Execution,
    /// `0x02`: compounding execution address.
    Compounding,
    Unknown(u8),
}

impl CredentialKind {
    pub fn of(credentials: &B256) -> Self {
        match credentials[0] {
            0x00 => Self::Bls,
            0x01 => Self::Execution,
            0x02 => Self::Compounding,
            other => Self::Unknown(other),
        }
    }
}

/// Credential type counts over a validator set.
///
/// Only `0x01` and `0x02` are counted; every other kind is in `sampled`
/// but in neither counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialTally {
    pub sampled: u64,
    pub type1: u64,
    pub type2: u64,
}

impl CredentialTally {
    pub fn of(validators: &[ValidatorState]) -> Self {
        validators.iter().fold(Self::default(), |mut tally, v| {
            tally.sampled += 1;
            match CredentialKind::of(&v.validator.withdrawal_credentials) {
                CredentialKind::Execution => tally.type1 += 1,
                CredentialKind::Compounding => tally.type2 += 1,
                CredentialKind::Bls | CredentialKind::Unknown(_) => {}
            }
            tally
        })
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;
    use exit_queue_types::{BlockPointer, ExitQueueSnapshot};

    use super::*;
    use crate::{
        api::ValidatorStatus,
        mock::{
            block, credentials, exit_message, exiting_validator, pubkey, validator,
            withdrawal_request,
        },
    };

    #[test]
    fn referenced_validators_are_batched_once() {
        let body = block(
            320,
            vec![exit_message(42, 10, 1), exit_message(7, 10, 2), exit_message(42, 10, 3)],
            vec![
                withdrawal_request(42, 10),
                withdrawal_request(3, 10),
                withdrawal_request(3, 20),
                withdrawal_request(9, 0),
            ],
        )
        .body;
        assert_eq!(
            referenced_validators(&body),
            vec![
                ValidatorId::Index(7),
                ValidatorId::Index(42),
                ValidatorId::Pubkey(pubkey(3)),
                ValidatorId::Pubkey(pubkey(42)),
            ]
        );
    }

    #[test]
    fn exit_without_validator_is_dropped() {
        let at = BlockPointer::from_slot(320);
        let validators = index_validators(vec![exiting_validator(42, 10, 32_000_000_000)]);
        let records = exit_records(
            at,
            &[exit_message(42, 10, 0xde), exit_message(99, 10, 0xdf)],
            &validators,
        );

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.validator_index, 42);
        assert_eq!(record.exit_epoch, 10);
        assert_eq!(record.withdrawable_epoch, 266);
        assert_eq!(record.observed_slot, 320);
        assert_eq!(record.observed_epoch, 10);
    }

    #[test]
    fn withdrawal_requests_join_validators_by_pubkey() {
        let at = BlockPointer::from_slot(320);
        let body = block(
            320,
            vec![],
            vec![
                withdrawal_request(1, 5),
                withdrawal_request(2, 0),
                withdrawal_request(3, 7),
                withdrawal_request(4, 1_000_000_000),
            ],
        )
        .body;
        let payload = body.execution_payload.clone().unwrap();
        let validators = index_validators(vec![
            validator(1, ValidatorStatus::ActiveOngoing),
            validator(2, ValidatorStatus::ActiveOngoing),
            exiting_validator(4, 12, 33_000_000_000),
        ]);

        let records =
            partial_withdrawal_records(at, &payload, body.withdrawal_requests(), &validators);

        // The second request is a full exit and validator 3 is unknown.
        assert_eq!(records.len(), 2);
        let first = &records[0];
        assert_eq!(first.validator_index, 1);
        assert_eq!(first.pubkey, pubkey(1));
        assert_eq!(first.recipient_address, Address::repeat_byte(0x22));
        assert_eq!(first.amount, 5);
        assert_eq!(first.fee, 0);
        assert_eq!(first.block_number, payload.block_number);
        assert_eq!(
            first.transaction_hash,
            PartialWithdrawalRecord::operation_key(&payload.block_hash, 0)
        );

        let second = &records[1];
        assert_eq!(second.validator_index, 4);
        assert_eq!(second.exit_epoch, 12);
        assert_eq!(second.balance, 33_000_000_000);
        assert_eq!(second.effective_balance, 32_000_000_000);
        assert_eq!(
            second.transaction_hash,
            PartialWithdrawalRecord::operation_key(&payload.block_hash, 3)
        );
        assert_eq!((second.observed_slot, second.observed_epoch), (320, 10));
    }

    #[test]
    fn empty_queue_yields_zero_sentinel() {
        let at = BlockPointer::from_slot(64);
        assert_eq!(summarize_exit_queue(at, vec![]), ExitQueueSnapshot::empty(at));
    }

    #[test]
    fn queue_summary_breaks_exit_epoch_ties_by_index() {
        let at = BlockPointer::from_slot(320);
        let snapshot = summarize_exit_queue(
            at,
            vec![
                exiting_validator(9, 12, 31_000_000_000),
                exiting_validator(5, 10, 32_000_000_000),
                exiting_validator(2, 12, 30_000_000_000),
                exiting_validator(8, 10, 32_000_000_000),
            ],
        );

        assert_eq!(snapshot.validators_in_queue, 4);
        assert_eq!(snapshot.earliest_exit_epoch, 10);
        assert_eq!(snapshot.earliest_withdrawable_epoch, 266);
        assert_eq!(snapshot.first_validator_index, 5);
        assert_eq!(snapshot.latest_exit_epoch, 12);
        assert_eq!(snapshot.latest_withdrawable_epoch, 268);
        assert_eq!(snapshot.last_validator_index, 9);
        assert_eq!(snapshot.balance_in_queue, 125_000_000_000);
        assert!(snapshot.first_validator_pubkey.starts_with("0x"));
        assert_eq!(snapshot.first_validator_pubkey.len(), 2 + 96);
    }

    #[test]
    fn credential_kinds_are_counted_exclusively() {
        let mut validators = Vec::new();
        for (index, prefix) in [0x01, 0x01, 0x02, 0x00, 0x03, 0xff].into_iter().enumerate() {
            let mut v = validator(index as u64, ValidatorStatus::ActiveOngoing);
            v.validator.withdrawal_credentials = credentials(prefix);
            validators.push(v);
        }

        let tally = CredentialTally::of(&validators);
        assert_eq!(
            tally,
            CredentialTally {
                sampled: 6,
                type1: 2,
                type2: 1,
            }
        );
        assert!(tally.type1 + tally.type2 <= tally.sampled);
        assert_eq!(CredentialKind::of(&credentials(0x03)), CredentialKind::Unknown(0x03));
    }
}
