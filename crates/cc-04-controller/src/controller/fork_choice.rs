//! Accepting blocks from the network, switching forks and moving blocks
//! into the block log once irreversible.

use super::Controller;
use crate::config::DbReadMode;
use crate::domain::pending_block::{BlockStage, BlockStatus, CompletedBlock, TrxMrootOrDigests};
use crate::error::{ChainError, Result};
use crate::events::emit;
use cc_02_block_log::BlockLog;
use cc_03_fork_database::{BlockState, BlockStatePtr, ForkDbError};
use shared_types::{
    BlockId, ReceiptTrx, SignedBlock, TaskFuture, TimePoint, TransactionId, TransactionMetadata,
    TransactionStatus, TrxType, TypeError,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Called with the blocks (tip first) dropped by a fork switch.
pub type ForkedBranchCallback<'a> = &'a dyn Fn(&[BlockStatePtr]);

/// Looks up already-recovered transaction metadata by id.
pub type TrxMetaCacheLookup<'a> = &'a dyn Fn(&TransactionId) -> Option<Arc<TransactionMetadata>>;

enum TrxMetaSource {
    Ready(Arc<TransactionMetadata>),
    Recovering(TaskFuture<std::result::Result<Arc<TransactionMetadata>, TypeError>>),
}

impl TrxMetaSource {
    fn get(self) -> Result<Arc<TransactionMetadata>> {
        match self {
            TrxMetaSource::Ready(meta) => Ok(meta),
            TrxMetaSource::Recovering(fut) => Ok(fut.wait()??),
        }
    }
}

impl Controller {
    /// Build the state of a received block on the thread pool.
    ///
    /// Fails immediately when the previous block is unknown.
    pub fn create_block_state_future(
        &self,
        id: &BlockId,
        block: Arc<SignedBlock>,
    ) -> Result<TaskFuture<Result<BlockStatePtr>>> {
        if let Some(existing) = self.fork_db.get_block(id) {
            return Ok(TaskFuture::ready(Ok(existing)));
        }
        let prev = self
            .fork_db
            .get_block_header(block.previous())
            .ok_or(ChainError::UnlinkableBlock { id: *id })?;
        let validator = self.feature_validator();
        let skip_validate_signee = false;
        let expected = *id;
        Ok(self.thread_pool.post(move || {
            let bsp = BlockState::from_block::<ChainError>(&prev.header_state, block, &validator, skip_validate_signee)?;
            if bsp.id() != expected {
                return Err(ChainError::BlockValidate(format!(
                    "provided id {expected} does not match block id {}",
                    bsp.id()
                )));
            }
            Ok(Arc::new(bsp))
        }))
    }

    /// Add a received block to the fork database and, outside irreversible
    /// mode, adopt the best branch.
    pub fn push_block(
        &mut self,
        block_state_future: TaskFuture<Result<BlockStatePtr>>,
        forked_branch_cb: Option<ForkedBranchCallback<'_>>,
        trx_lookup: TrxMetaCacheLookup<'_>,
    ) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        let bsp = block_state_future.wait()??;
        let was_trusted = self.trusted_producer_light_validation;
        let result = self.accept_block(bsp, forked_branch_cb, trx_lookup);
        self.trusted_producer_light_validation = was_trusted;
        result
    }

    fn accept_block(
        &mut self,
        bsp: BlockStatePtr,
        forked_branch_cb: Option<ForkedBranchCallback<'_>>,
        trx_lookup: TrxMetaCacheLookup<'_>,
    ) -> Result<()> {
        emit(&self.signals.pre_accepted_block, &bsp.block)?;
        self.fork_db.add(bsp.clone(), false)?;
        if self.config.trusted_producers.contains(&bsp.block.header.producer) {
            self.trusted_producer_light_validation = true;
        }
        emit(&self.signals.accepted_block_header, &bsp)?;

        if self.config.read_mode != DbReadMode::Irreversible {
            let Some(new_head) = self.fork_db.pending_head() else {
                return Err(ForkDbError::RootNotSet.into());
            };
            self.maybe_switch_forks(&new_head, BlockStatus::Complete, forked_branch_cb, trx_lookup)
        } else {
            self.log_irreversible()
        }
    }

    pub(super) fn maybe_switch_forks(
        &mut self,
        new_head: &BlockStatePtr,
        status: BlockStatus,
        forked_branch_cb: Option<ForkedBranchCallback<'_>>,
        trx_lookup: TrxMetaCacheLookup<'_>,
    ) -> Result<()> {
        let head_id = self.head.id();
        if *new_head.previous() == head_id {
            if let Err(e) = self.apply_block(new_head, status, trx_lookup) {
                self.discard_from_fork_db(&new_head.id());
                return Err(e);
            }
            self.fork_db.mark_valid(new_head)?;
        } else if new_head.id() != head_id {
            info!(
                from = %head_id,
                from_num = self.head.block_num(),
                to = %new_head.id(),
                to_num = new_head.block_num(),
                "[cc-04] switching forks"
            );
            let (new_branch, old_branch) = self.fork_db.fetch_branch_from(&new_head.id(), &head_id)?;
            let Some(fork_base) = new_branch.last().map(|b| *b.previous()) else {
                return Err(ChainError::Fatal("fork switch with an empty new branch".into()));
            };
            if !old_branch.is_empty() {
                for _ in &old_branch {
                    self.pop_block()?;
                }
                if self.head.id() != fork_base {
                    return Err(ChainError::Fatal(
                        "loss of sync between fork database and state during fork switch".into(),
                    ));
                }
                if let Some(cb) = forked_branch_cb {
                    cb(&old_branch);
                }
            }

            for (applied, bsp) in new_branch.iter().rev().enumerate() {
                let status = if bsp.is_valid() {
                    BlockStatus::Validated
                } else {
                    BlockStatus::Complete
                };
                let result = self
                    .apply_block(bsp, status, trx_lookup)
                    .and_then(|_| Ok(self.fork_db.mark_valid(bsp)?));
                let Err(e) = result else { continue };

                error!(block = %bsp.id(), error = %e, "[cc-04] fork switch failed, restoring previous branch");
                self.discard_from_fork_db(&bsp.id());
                for _ in 0..applied {
                    self.pop_block()?;
                }
                if self.head.id() != fork_base {
                    return Err(ChainError::Fatal(
                        "loss of sync between fork database and state during fork switch reversal".into(),
                    ));
                }
                for old in old_branch.iter().rev() {
                    self.apply_block(old, BlockStatus::Validated, trx_lookup)?;
                    self.fork_db.mark_valid(old)?;
                }
                return Err(e);
            }
            info!(head = %new_head.id(), "[cc-04] switched fork");
        } else {
            return Ok(());
        }
        self.log_irreversible()
    }

    fn discard_from_fork_db(&mut self, id: &BlockId) {
        if let Err(e) = self.fork_db.remove(id) {
            warn!(block = %id, error = %e, "[cc-04] could not remove failed block from fork database");
        }
    }

    /// Re-execute `bsp` as a pending block and commit it if it reproduces
    /// the same header.
    pub(super) fn apply_block(
        &mut self,
        bsp: &BlockStatePtr,
        status: BlockStatus,
        trx_lookup: TrxMetaCacheLookup<'_>,
    ) -> Result<()> {
        let result = self.try_apply_block(bsp, status, trx_lookup);
        if let Err(e) = &result {
            debug!(block = %bsp.id(), error = %e, "[cc-04] apply block failed");
            self.abort_block();
        }
        result
    }

    fn try_apply_block(
        &mut self,
        bsp: &BlockStatePtr,
        status: BlockStatus,
        trx_lookup: TrxMetaCacheLookup<'_>,
    ) -> Result<()> {
        let b = bsp.block.clone();
        let producer_block_id = bsp.id();
        self.start_block_with(
            b.header.timestamp,
            b.header.confirmed,
            b.header.new_protocol_feature_activations.clone(),
            status,
            Some(producer_block_id),
        )?;
        if status == BlockStatus::Irreversible && !self.config.force_all_checks {
            if let Some(pending) = self.pending.as_mut() {
                pending.building_mut()?.trx_mroot_or_receipt_digests =
                    TrxMrootOrDigests::Mroot(b.header.transaction_mroot);
            }
        }

        let skip_auth = self.skip_auth_check();
        let cached = bsp.trxs_metas();
        let use_cached = skip_auth && !cached.is_empty();
        let mut metas = Vec::new();
        if !use_cached {
            let trx_type = if status == BlockStatus::Complete {
                TrxType::Input
            } else {
                TrxType::Replay
            };
            for receipt in &b.transactions {
                let ReceiptTrx::Packed(pt) = &receipt.trx else { continue };
                let known = trx_lookup(&pt.id()).filter(|m| **m.packed_trx() == *pt);
                let source = match known {
                    Some(m) if skip_auth || !m.recovered_keys().is_empty() => TrxMetaSource::Ready(m),
                    _ if skip_auth => TrxMetaSource::Ready(TransactionMetadata::create_no_recover_keys(
                        Arc::new(pt.clone()),
                        trx_type,
                    )),
                    _ => TrxMetaSource::Recovering(TransactionMetadata::start_recover_keys(
                        &self.thread_pool,
                        Arc::new(pt.clone()),
                        self.chain_id,
                        trx_type,
                    )),
                };
                metas.push(source);
            }
        }

        let mut packed_sources = metas.into_iter();
        let mut packed_idx = 0usize;
        for receipt in &b.transactions {
            let receipts_before = self.pending_receipt_count()?;
            let trace = match &receipt.trx {
                ReceiptTrx::Packed(_) => {
                    let meta = if use_cached {
                        cached.get(packed_idx).cloned().ok_or_else(|| {
                            ChainError::BlockValidate("cached transaction metadata does not match block".into())
                        })?
                    } else {
                        packed_sources
                            .next()
                            .ok_or_else(|| ChainError::BlockValidate("missing transaction metadata".into()))?
                            .get()?
                    };
                    packed_idx += 1;
                    self.push_transaction_with_net(
                        meta,
                        TimePoint::MAX,
                        receipt.header.cpu_usage_us,
                        true,
                        Some(receipt.header.net_usage_words),
                    )?
                }
                ReceiptTrx::Id(id) => {
                    self.push_scheduled_transaction(id, TimePoint::MAX, receipt.header.cpu_usage_us, true)?
                }
            };

            let can_fail =
                receipt.header.status == TransactionStatus::HardFail && matches!(receipt.trx, ReceiptTrx::Id(_));
            if let Some(except) = &trace.except {
                if !can_fail {
                    return Err(ChainError::BlockValidate(format!(
                        "transaction {} failed in block {}: {}",
                        receipt.trx_id(),
                        b.block_num(),
                        except.message
                    )));
                }
            }
            let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
            let receipts = &pending.building()?.pending_trx_receipts;
            if receipts.len() != receipts_before + 1 {
                return Err(ChainError::BlockValidate(format!(
                    "expected a receipt, block_num {}, block_id {producer_block_id}",
                    b.block_num()
                )));
            }
            let produced = receipts.last().map(|r| &r.header);
            if produced != Some(&receipt.header) {
                return Err(ChainError::BlockValidate(format!(
                    "receipt does not match, {produced:?} != {:?}",
                    receipt.header
                )));
            }
        }

        self.finalize_block()?;
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;
        let BlockStage::Assembled(assembled) = &pending.block_stage else {
            return Err(ChainError::BlockStage("apply_block expects an assembled block"));
        };
        let header = &assembled.unsigned_block.header;
        if header.transaction_mroot != b.header.transaction_mroot {
            return Err(ChainError::ObjectiveBlockValidation(format!(
                "transaction_mroot mismatch: {} != {}",
                header.transaction_mroot, b.header.transaction_mroot
            )));
        }
        if header.action_mroot != b.header.action_mroot {
            return Err(ChainError::ObjectiveBlockValidation(format!(
                "action_mroot mismatch: {} != {}",
                header.action_mroot, b.header.action_mroot
            )));
        }
        if assembled.id != producer_block_id {
            return Err(ChainError::BlockValidate(format!(
                "Block ID does not match, {} != {producer_block_id}",
                assembled.id
            )));
        }
        if !use_cached {
            bsp.set_trxs_metas(assembled.trx_metas.clone());
        }
        pending.block_stage = BlockStage::Completed(CompletedBlock {
            block_state: bsp.clone(),
        });
        self.commit_block_internal(false)
    }

    fn pending_receipt_count(&self) -> Result<usize> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        Ok(pending.building()?.pending_trx_receipts.len())
    }

    /// Append every block the fork database head made irreversible to the
    /// block log and advance the fork database root.
    pub(super) fn log_irreversible(&mut self) -> Result<()> {
        let root = self.fork_db.root().ok_or(ForkDbError::RootNotSet)?;
        let lib_num = match self.block_log.head() {
            Some(log_head) => {
                if root.id() != log_head.id() {
                    return Err(ForkDbError::Invariant("fork database root does not match block log head").into());
                }
                log_head.block_num()
            }
            None => {
                let lib_num = self.block_log.first_block_num().saturating_sub(1);
                if root.block_num() != lib_num {
                    return Err(ForkDbError::Invariant(
                        "fork database root is not the block before the empty block log's first block",
                    )
                    .into());
                }
                lib_num
            }
        };

        let Some(fork_head) = self.fork_db_head() else {
            return Ok(());
        };
        if fork_head.dpos_irreversible_blocknum() <= lib_num {
            return Ok(());
        }
        let branch = self
            .fork_db
            .fetch_branch(&fork_head.id(), fork_head.dpos_irreversible_blocknum());
        let compression = self.block_log.compression();
        let entries: Vec<_> = branch
            .iter()
            .rev()
            .filter(|b| b.block_num() > lib_num)
            .map(|b| (b.clone(), BlockLog::create_append_future(&self.thread_pool, b.block.clone(), compression)))
            .collect();

        let mut root_id = root.id();
        let result = self.append_irreversible(entries, &mut root_id);
        if root_id != root.id() {
            self.fork_db.advance_root(&root_id)?;
        }
        result?;

        if let Some(root) = self.fork_db.root() {
            self.reversible_blocks.remove_up_to(root.block_num())?;
            debug!(lib = root.block_num(), "[cc-04] irreversible blocks logged");
        }
        Ok(())
    }

    fn append_irreversible(
        &mut self,
        entries: Vec<(BlockStatePtr, TaskFuture<cc_02_block_log::Result<cc_02_block_log::PreparedEntry>>)>,
        root_id: &mut BlockId,
    ) -> Result<()> {
        for (bsp, entry) in entries {
            if self.config.read_mode == DbReadMode::Irreversible {
                self.apply_block(&bsp, BlockStatus::Complete, &|_| None)?;
                self.fork_db.mark_valid(&bsp)?;
            }
            emit(&self.signals.irreversible_block, &bsp)?;
            // logged before the state commit so a failed append leaves both behind
            self.block_log.append_prepared(entry.wait()??, bsp.block.clone())?;
            self.db.commit(bsp.block_num() as u64);
            *root_id = bsp.id();
        }
        Ok(())
    }

    /// Undo the head block and make its predecessor the head.
    pub fn pop_block(&mut self) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        let prev_id = *self.head.previous();
        let prev = match self.fork_db.get_block(&prev_id) {
            Some(prev) => prev,
            None => {
                let root = self.fork_db.root().ok_or(ForkDbError::RootNotSet)?;
                if root.id() != prev_id {
                    return Err(ForkDbError::Invariant("attempt to pop beyond last irreversible block").into());
                }
                root
            }
        };
        self.reversible_blocks.remove(self.head.block_num())?;
        let popped = std::mem::replace(&mut self.head, prev);
        self.db.undo()?;
        self.protocol_features.popped_blocks_to(self.head.block_num());
        debug!(popped = popped.block_num(), head = self.head.block_num(), "[cc-04] block popped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ChainError;
    use crate::test_utils::TestChain;
    use cc_03_fork_database::{BlockStatePtr, ForkDbError};
    use shared_types::BlockTimestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Produce a block `slots` slots after the head.
    fn produce_at(chain: &mut TestChain, slots: i64) -> BlockStatePtr {
        let when = chain.controller.head_block_time().add_micros(500_000 * slots);
        chain.controller.start_block(BlockTimestamp::from(when), 0).unwrap();
        chain.finish()
    }

    fn push(chain: &mut TestChain, block: &BlockStatePtr) -> Result<(), ChainError> {
        let fut = chain
            .controller
            .create_block_state_future(&block.id(), block.block.clone())?;
        chain.controller.push_block(fut, None, &|_| None)
    }

    #[test]
    fn test_push_block_extends_head() {
        let mut producer = TestChain::new();
        let mut validator = TestChain::new();
        let b2 = producer.produce_block();
        let b3 = producer.produce_block();
        push(&mut validator, &b2).unwrap();
        push(&mut validator, &b3).unwrap();
        assert_eq!(validator.controller.head_block_id(), b3.id());
        assert_eq!(validator.controller.last_irreversible_block_num(), 2);
        assert_eq!(validator.controller.fetch_block_by_number(2).unwrap().unwrap().id(), b2.id());
        // pushing a known block again is a no-op
        assert!(validator.controller.create_block_state_future(&b3.id(), b3.block.clone()).is_ok());
    }

    #[test]
    fn test_unlinkable_block_rejected() {
        let mut producer = TestChain::new();
        let mut validator = TestChain::new();
        producer.produce_block();
        let b3 = producer.produce_block();
        assert!(matches!(push(&mut validator, &b3), Err(ChainError::UnlinkableBlock { .. })));
        assert_eq!(validator.controller.head_block_num(), 1);
    }

    #[test]
    fn test_push_block_rejected_while_building() {
        let mut producer = TestChain::new();
        let mut validator = TestChain::new();
        let b2 = producer.produce_block();
        let fut = validator
            .controller
            .create_block_state_future(&b2.id(), b2.block.clone())
            .unwrap();
        validator.start();
        assert!(matches!(
            validator.controller.push_block(fut, None, &|_| None),
            Err(ChainError::PendingBlockExists)
        ));
    }

    #[test]
    fn test_longer_fork_wins() {
        let mut a = TestChain::new();
        let mut b = TestChain::new();
        let a2 = produce_at(&mut a, 1);
        let b2 = produce_at(&mut b, 2);
        let b3 = produce_at(&mut b, 1);

        push(&mut a, &b2).unwrap();
        // same rank as the current head: no switch
        assert_eq!(a.controller.head_block_id(), a2.id());

        let forked = Arc::new(AtomicUsize::new(0));
        let seen = forked.clone();
        let cb = move |branch: &[BlockStatePtr]| {
            seen.store(branch.len(), Ordering::SeqCst);
        };
        let fut = a.controller.create_block_state_future(&b3.id(), b3.block.clone()).unwrap();
        a.controller.push_block(fut, Some(&cb), &|_| None).unwrap();
        assert_eq!(a.controller.head_block_id(), b3.id());
        assert_eq!(forked.load(Ordering::SeqCst), 1);
        assert_eq!(a.controller.last_irreversible_block_id(), Some(b2.id()));
        assert_eq!(a.controller.get_block_id_for_num(2).unwrap(), Some(b2.id()));
        assert_eq!(a.controller.db().revision(), 3);
    }

    #[test]
    fn test_empty_block_log_must_start_after_root() {
        let mut chain = TestChain::new();
        let chain_id = chain.controller.chain_id();
        chain.controller.block_log.reset(chain_id, 5).unwrap();
        chain.start();
        chain.controller.finalize_block().unwrap();
        chain.controller.sign_block(&TestChain::signer).unwrap();
        let err = chain.controller.commit_block().unwrap_err();
        assert!(matches!(err, ChainError::ForkDb(ForkDbError::Invariant(_))), "{err:?}");
        assert!(chain.controller.pending_block_stage().is_none());
    }

    #[test]
    fn test_pop_block_stops_at_root() {
        let mut chain = TestChain::new();
        let b2 = chain.produce_block();
        chain.produce_block();
        chain.controller.pop_block().unwrap();
        assert_eq!(chain.controller.head_block_id(), b2.id());
        assert_eq!(chain.controller.db().revision(), 2);

        let err = chain.controller.pop_block().unwrap_err();
        assert!(matches!(err, ChainError::ForkDb(ForkDbError::Invariant(_))));
        assert_eq!(chain.controller.head_block_num(), 2);
    }
}
