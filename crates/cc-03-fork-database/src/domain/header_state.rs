//! # Block Header State
//!
//! Everything about a block that can be derived from headers alone: the
//! active and pending producer schedules, DPOS irreversibility, the
//! blockroot merkle and the set of activated protocol features.
//!
//! ## Transition
//!
//! ```text
//!   BlockHeaderState(n) ──next(when, confirmed)──► PendingBlockHeaderState(n+1)
//!                                                     │
//!                          make_block_header(..) ◄────┤
//!                                                     │
//!   BlockHeaderState(n+1) ◄──finish_next(header, validator, signer | verify)
//! ```
//!
//! ## DPOS irreversibility
//!
//! Each new block appends `2/3 * producers + 1` to `confirm_count` and
//! decrements the entries it confirms (its own block plus `confirmed`
//! earlier ones). The newest entry reaching zero becomes the proposed LIB.
//! The LIB is the value at index `(n - 1) / 3` after partially sorting the
//! producers' last implied irreversible blocks.

use super::errors::{ForkDbError, Result};
use serde::{Deserialize, Serialize};
use shared_types::{
    AccountName, BlockHeader, BlockId, BlockTimestamp, Digest, IncrementalMerkle, ProducerKey,
    ProducerSchedule, PublicKey, Signature,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Consecutive slots assigned to each producer.
pub const PRODUCER_REPETITIONS: u32 = 12;

/// Cap on the confirmation window.
pub const MAX_TRACKED_DPOS_CONFIRMATIONS: usize = 1024;

/// Protocol features activated on a branch, up to and including a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolFeatureActivationSet {
    pub protocol_features: BTreeSet<Digest>,
}

impl ProtocolFeatureActivationSet {
    pub fn extend(prev: &ProtocolFeatureActivationSet, new_features: &[Digest]) -> Self {
        let mut protocol_features = prev.protocol_features.clone();
        protocol_features.extend(new_features.iter().copied());
        Self { protocol_features }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    /// Block that proposed the schedule; it activates once this is irreversible.
    pub schedule_lib_num: u32,
    pub schedule_hash: Digest,
    pub schedule: ProducerSchedule,
}

/// Fields shared by pending and finished header states.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderStateCommon {
    pub block_num: u32,
    pub dpos_proposed_irreversible_blocknum: u32,
    pub dpos_irreversible_blocknum: u32,
    pub active_schedule: ProducerSchedule,
    pub blockroot_merkle: IncrementalMerkle,
    pub producer_to_last_produced: BTreeMap<AccountName, u32>,
    pub producer_to_last_implied_irb: BTreeMap<AccountName, u32>,
    pub valid_block_signing_key: PublicKey,
    pub confirm_count: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderState {
    pub common: HeaderStateCommon,
    pub id: BlockId,
    pub header: BlockHeader,
    pub producer_signature: Signature,
    pub pending_schedule: ScheduleInfo,
    pub activated_protocol_features: Arc<ProtocolFeatureActivationSet>,
}

/// Validates protocol features a header activates:
/// `(timestamp, already_activated, newly_activated)`.
pub type FeatureValidator<'a, E> =
    &'a dyn Fn(BlockTimestamp, &BTreeSet<Digest>, &[Digest]) -> std::result::Result<(), E>;

impl BlockHeaderState {
    /// Header state of block 1.
    pub fn genesis(initial_timestamp: BlockTimestamp, initial_key: PublicKey, chain_id: Digest) -> Self {
        let schedule = ProducerSchedule {
            version: 0,
            producers: vec![ProducerKey {
                producer_name: shared_types::system_account(),
                block_signing_key: initial_key,
            }],
        };
        let header = BlockHeader {
            timestamp: initial_timestamp,
            action_mroot: chain_id,
            ..Default::default()
        };
        let id = header.calculate_id();
        Self {
            common: HeaderStateCommon {
                block_num: header.block_num(),
                active_schedule: schedule.clone(),
                valid_block_signing_key: initial_key,
                ..Default::default()
            },
            id,
            header,
            producer_signature: Signature::default(),
            pending_schedule: ScheduleInfo {
                schedule_lib_num: 0,
                schedule_hash: Digest::hash_of(&schedule),
                schedule,
            },
            activated_protocol_features: Arc::new(ProtocolFeatureActivationSet::default()),
        }
    }

    pub fn block_num(&self) -> u32 {
        self.common.block_num
    }

    pub fn dpos_irreversible_blocknum(&self) -> u32 {
        self.common.dpos_irreversible_blocknum
    }

    pub fn previous(&self) -> &BlockId {
        &self.header.previous
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// Producer owning slot `t` in the active schedule.
    pub fn get_scheduled_producer(&self, t: BlockTimestamp) -> Option<&ProducerKey> {
        let producers = &self.common.active_schedule.producers;
        if producers.is_empty() {
            return None;
        }
        let span = producers.len() as u32 * PRODUCER_REPETITIONS;
        let index = (t.slot % span) / PRODUCER_REPETITIONS;
        producers.get(index as usize)
    }

    pub fn calc_dpos_last_irreversible(&self, producer_of_next_block: &AccountName) -> u32 {
        let mut blocknums: Vec<u32> = self
            .common
            .producer_to_last_implied_irb
            .iter()
            .map(|(name, num)| {
                if name == producer_of_next_block {
                    self.common.dpos_proposed_irreversible_blocknum
                } else {
                    *num
                }
            })
            .collect();
        if blocknums.is_empty() {
            return 0;
        }
        let idx = (blocknums.len() - 1) / 3;
        let (_, nth, _) = blocknums.select_nth_unstable(idx);
        *nth
    }

    /// Advance one block to slot `when` (the next slot if `None`).
    pub fn next(
        &self,
        when: Option<BlockTimestamp>,
        num_prev_blocks_to_confirm: u16,
    ) -> Result<PendingBlockHeaderState> {
        let when = match when {
            Some(t) => {
                if t <= self.header.timestamp {
                    return Err(ForkDbError::BlockNotInFuture);
                }
                t
            }
            None => self.header.timestamp.next(),
        };
        let proauth = self
            .get_scheduled_producer(when)
            .cloned()
            .ok_or(ForkDbError::ProducerSchedule("active schedule is empty"))?;

        let block_num = self.common.block_num + 1;
        if let Some(&last) = self.common.producer_to_last_produced.get(&proauth.producer_name) {
            if last >= block_num.saturating_sub(num_prev_blocks_to_confirm as u32) {
                return Err(ForkDbError::ProducerDoubleConfirm {
                    producer: proauth.producer_name.to_string(),
                });
            }
        }

        let mut result = HeaderStateCommon {
            block_num,
            valid_block_signing_key: proauth.block_signing_key,
            blockroot_merkle: self.common.blockroot_merkle.clone(),
            ..Default::default()
        };
        result.blockroot_merkle.append(self.id);

        let required_confs = (self.common.active_schedule.len() * 2 / 3 + 1) as u8;
        let mut confirm_count = self.common.confirm_count.clone();
        if confirm_count.len() >= MAX_TRACKED_DPOS_CONFIRMATIONS {
            confirm_count.remove(0);
        }
        confirm_count.push(required_confs);

        let mut new_proposed = self.common.dpos_proposed_irreversible_blocknum;
        let mut blocks_to_confirm = num_prev_blocks_to_confirm as u32 + 1;
        let len = confirm_count.len();
        let mut i = len as i64 - 1;
        while i >= 0 && blocks_to_confirm > 0 {
            let idx = i as usize;
            confirm_count[idx] = confirm_count[idx].saturating_sub(1);
            if confirm_count[idx] == 0 {
                new_proposed = block_num - (len - 1 - idx) as u32;
                confirm_count.drain(..=idx);
                break;
            }
            i -= 1;
            blocks_to_confirm -= 1;
        }
        result.confirm_count = confirm_count;
        result.dpos_proposed_irreversible_blocknum = new_proposed;
        result.dpos_irreversible_blocknum = self.calc_dpos_last_irreversible(&proauth.producer_name);

        let promote = !self.pending_schedule.schedule.producers.is_empty()
            && result.dpos_irreversible_blocknum >= self.pending_schedule.schedule_lib_num;

        if promote {
            result.active_schedule = self.pending_schedule.schedule.clone();
            for p in &result.active_schedule.producers {
                let last_produced = if p.producer_name == proauth.producer_name {
                    block_num
                } else {
                    self.common
                        .producer_to_last_produced
                        .get(&p.producer_name)
                        .copied()
                        .unwrap_or(result.dpos_irreversible_blocknum)
                };
                result
                    .producer_to_last_produced
                    .insert(p.producer_name.clone(), last_produced);

                let implied_irb = if p.producer_name == proauth.producer_name {
                    self.common.dpos_proposed_irreversible_blocknum
                } else {
                    self.common
                        .producer_to_last_implied_irb
                        .get(&p.producer_name)
                        .copied()
                        .unwrap_or(result.dpos_irreversible_blocknum)
                };
                result
                    .producer_to_last_implied_irb
                    .insert(p.producer_name.clone(), implied_irb);
            }
            result
                .producer_to_last_produced
                .insert(proauth.producer_name.clone(), block_num);
        } else {
            result.active_schedule = self.common.active_schedule.clone();
            result.producer_to_last_produced = self.common.producer_to_last_produced.clone();
            result
                .producer_to_last_produced
                .insert(proauth.producer_name.clone(), block_num);
            result.producer_to_last_implied_irb = self.common.producer_to_last_implied_irb.clone();
            result.producer_to_last_implied_irb.insert(
                proauth.producer_name.clone(),
                self.common.dpos_proposed_irreversible_blocknum,
            );
        }

        Ok(PendingBlockHeaderState {
            common: result,
            prev_activated_protocol_features: self.activated_protocol_features.clone(),
            prev_pending_schedule: self.pending_schedule.clone(),
            was_pending_promoted: promote,
            previous: self.id,
            producer: proauth.producer_name,
            timestamp: when,
            active_schedule_version: self.common.active_schedule.version,
            confirmed: num_prev_blocks_to_confirm,
        })
    }

    /// Header state of a received block built on `self`.
    pub fn next_from_header<E: From<ForkDbError>>(
        &self,
        header: &BlockHeader,
        signature: &Signature,
        validator: FeatureValidator<'_, E>,
        skip_validate_signee: bool,
    ) -> std::result::Result<BlockHeaderState, E> {
        let pending = self.next(Some(header.timestamp), header.confirmed)?;
        let mut result = pending.finish_next_inner(header, validator)?;
        result.producer_signature = signature.clone();
        if !skip_validate_signee {
            result.verify_signee()?;
        }
        Ok(result)
    }

    /// Digest signed by the producer.
    pub fn sig_digest(&self) -> Digest {
        let header_bmroot = Digest::hash_pair(&self.header.digest(), &self.common.blockroot_merkle.root());
        Digest::hash_pair(&header_bmroot, &self.pending_schedule.schedule_hash)
    }

    pub fn sign(&mut self, signer: &dyn Fn(&Digest) -> Signature) -> Result<()> {
        self.producer_signature = signer(&self.sig_digest());
        self.verify_signee()
    }

    pub fn verify_signee(&self) -> Result<()> {
        let key = self
            .producer_signature
            .recover(&self.sig_digest())
            .map_err(ForkDbError::InvalidSignature)?;
        if key != self.common.valid_block_signing_key {
            return Err(ForkDbError::WrongSigningKey);
        }
        Ok(())
    }
}

/// Header state of the block under construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingBlockHeaderState {
    pub common: HeaderStateCommon,
    pub prev_activated_protocol_features: Arc<ProtocolFeatureActivationSet>,
    pub prev_pending_schedule: ScheduleInfo,
    pub was_pending_promoted: bool,
    pub previous: BlockId,
    pub producer: AccountName,
    pub timestamp: BlockTimestamp,
    pub active_schedule_version: u32,
    pub confirmed: u16,
}

impl PendingBlockHeaderState {
    pub fn block_num(&self) -> u32 {
        self.common.block_num
    }

    pub fn make_block_header(
        &self,
        transaction_mroot: Digest,
        action_mroot: Digest,
        new_producers: Option<ProducerSchedule>,
        new_protocol_feature_activations: Vec<Digest>,
    ) -> BlockHeader {
        BlockHeader {
            timestamp: self.timestamp,
            producer: self.producer.clone(),
            confirmed: self.confirmed,
            previous: self.previous,
            transaction_mroot,
            action_mroot,
            schedule_version: self.active_schedule_version,
            new_producers,
            new_protocol_feature_activations,
        }
    }

    fn finish_next_inner<E: From<ForkDbError>>(
        self,
        h: &BlockHeader,
        validator: FeatureValidator<'_, E>,
    ) -> std::result::Result<BlockHeaderState, E> {
        if h.timestamp != self.timestamp {
            return Err(ForkDbError::HeaderMismatch { field: "timestamp" }.into());
        }
        if h.previous != self.previous {
            return Err(ForkDbError::UnlinkableBlock { id: h.calculate_id() }.into());
        }
        if h.confirmed != self.confirmed {
            return Err(ForkDbError::HeaderMismatch { field: "confirmed" }.into());
        }
        if h.producer != self.producer {
            return Err(ForkDbError::WrongProducer.into());
        }
        if h.schedule_version != self.active_schedule_version {
            return Err(ForkDbError::ProducerSchedule("schedule_version in signed block is corrupted").into());
        }
        if let Some(np) = &h.new_producers {
            if self.was_pending_promoted {
                return Err(ForkDbError::ProducerSchedule(
                    "cannot set pending producer schedule in the same block in which pending was promoted to active",
                )
                .into());
            }
            if np.version != self.common.active_schedule.version + 1 {
                return Err(ForkDbError::ProducerSchedule("wrong producer schedule version specified").into());
            }
            if !self.prev_pending_schedule.schedule.producers.is_empty() {
                return Err(ForkDbError::ProducerSchedule(
                    "cannot set new pending producers until last pending is confirmed",
                )
                .into());
            }
        }

        let activated = if h.new_protocol_feature_activations.is_empty() {
            self.prev_activated_protocol_features.clone()
        } else {
            validator(
                self.timestamp,
                &self.prev_activated_protocol_features.protocol_features,
                &h.new_protocol_feature_activations,
            )?;
            Arc::new(ProtocolFeatureActivationSet::extend(
                &self.prev_activated_protocol_features,
                &h.new_protocol_feature_activations,
            ))
        };

        let block_num = self.common.block_num;
        let pending_schedule = match &h.new_producers {
            Some(np) => ScheduleInfo {
                schedule_lib_num: block_num,
                schedule_hash: Digest::hash_of(np),
                schedule: np.clone(),
            },
            None => {
                let mut info = self.prev_pending_schedule;
                if self.was_pending_promoted {
                    info.schedule.producers.clear();
                }
                info
            }
        };

        Ok(BlockHeaderState {
            common: self.common,
            id: h.calculate_id(),
            header: h.clone(),
            producer_signature: Signature::default(),
            pending_schedule,
            activated_protocol_features: activated,
        })
    }

    /// Finish a locally produced block and sign it.
    pub fn finish_next<E: From<ForkDbError>>(
        self,
        h: &BlockHeader,
        validator: FeatureValidator<'_, E>,
        signer: &dyn Fn(&Digest) -> Signature,
    ) -> std::result::Result<BlockHeaderState, E> {
        let mut result = self.finish_next_inner(h, validator)?;
        result.sign(signer)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::PrivateKey;

    fn no_features(
        _: BlockTimestamp,
        _: &BTreeSet<Digest>,
        _: &[Digest],
    ) -> std::result::Result<(), ForkDbError> {
        Ok(())
    }

    fn produce(prev: &BlockHeaderState, key: &PrivateKey, confirmed: u16) -> BlockHeaderState {
        let pending = prev.next(None, confirmed).unwrap();
        let header = pending.make_block_header(Digest::ZERO, Digest::ZERO, None, vec![]);
        pending
            .finish_next::<ForkDbError>(&header, &no_features, &|d| key.sign(d))
            .unwrap()
    }

    #[test]
    fn test_single_producer_lib_trails_head_by_one() {
        let key = PrivateKey::from_seed("system");
        let genesis = BlockHeaderState::genesis(BlockTimestamp::new(100), key.public_key(), Digest::ZERO);
        assert_eq!(genesis.block_num(), 1);
        let mut head = genesis;
        for _ in 0..5 {
            head = produce(&head, &key, 0);
        }
        assert_eq!(head.block_num(), 6);
        assert_eq!(head.dpos_irreversible_blocknum(), 5);
    }

    #[test]
    fn test_next_rejects_past_timestamp() {
        let key = PrivateKey::from_seed("system");
        let genesis = BlockHeaderState::genesis(BlockTimestamp::new(100), key.public_key(), Digest::ZERO);
        assert_eq!(
            genesis.next(Some(BlockTimestamp::new(100)), 0).unwrap_err(),
            ForkDbError::BlockNotInFuture
        );
    }

    #[test]
    fn test_received_header_verifies_signee() {
        let key = PrivateKey::from_seed("system");
        let genesis = BlockHeaderState::genesis(BlockTimestamp::new(1), key.public_key(), Digest::ZERO);
        let produced = produce(&genesis, &key, 0);
        let rebuilt = genesis
            .next_from_header::<ForkDbError>(&produced.header, &produced.producer_signature, &no_features, false)
            .unwrap();
        assert_eq!(rebuilt.id, produced.id);

        let forged = PrivateKey::from_seed("mallory").sign(&produced.sig_digest());
        assert!(genesis
            .next_from_header::<ForkDbError>(&produced.header, &forged, &no_features, false)
            .is_err());
    }

    #[test]
    fn test_calc_dpos_last_irreversible_picks_lower_third() {
        let mut state = BlockHeaderState::default();
        for (i, n) in [10u32, 40, 20, 30].iter().enumerate() {
            state
                .common
                .producer_to_last_implied_irb
                .insert(AccountName::new(format!("p{i}")), *n);
        }
        // (4 - 1) / 3 = 1 -> second smallest
        assert_eq!(state.calc_dpos_last_irreversible(&AccountName::new("other")), 20);
    }

    #[test]
    fn test_scheduled_producer_rotates_every_twelve_slots() {
        let mut state = BlockHeaderState::default();
        state.common.active_schedule.producers = ["a", "b"]
            .iter()
            .map(|n| ProducerKey {
                producer_name: AccountName::new(*n),
                block_signing_key: PublicKey::default(),
            })
            .collect();
        let name = |slot| {
            state
                .get_scheduled_producer(BlockTimestamp::new(slot))
                .unwrap()
                .producer_name
                .to_string()
        };
        assert_eq!(name(0), "a");
        assert_eq!(name(11), "a");
        assert_eq!(name(12), "b");
        assert_eq!(name(24), "a");
    }

    #[test]
    fn test_new_producers_become_pending_then_active() {
        let key = PrivateKey::from_seed("system");
        let genesis = BlockHeaderState::genesis(BlockTimestamp::new(1), key.public_key(), Digest::ZERO);
        let b2 = produce(&genesis, &key, 0);
        let schedule = ProducerSchedule {
            version: 1,
            producers: vec![ProducerKey {
                producer_name: shared_types::system_account(),
                block_signing_key: key.public_key(),
            }],
        };
        let pending = b2.next(None, 0).unwrap();
        let header = pending.make_block_header(Digest::ZERO, Digest::ZERO, Some(schedule.clone()), vec![]);
        let b3 = pending
            .finish_next::<ForkDbError>(&header, &no_features, &|d| key.sign(d))
            .unwrap();
        assert_eq!(b3.pending_schedule.schedule_lib_num, 3);

        let mut head = b3;
        while head.common.active_schedule.version == 0 {
            head = produce(&head, &key, 0);
            assert!(head.block_num() < 10);
        }
        assert_eq!(head.common.active_schedule, schedule);
        assert!(head.pending_schedule.schedule.producers.is_empty());
    }
}
