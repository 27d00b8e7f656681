//! Building, assembling, signing and committing the pending block.

use super::Controller;
use crate::config::DbReadMode;
use crate::domain::chain_objects::{
    ActivatedProtocolFeature, BlockSummaryObject, GlobalPropertyObject, ProtocolStateObject,
    TransactionObject,
};
use crate::domain::pending_block::{
    AssembledBlock, BlockStage, BlockStatus, BuildingBlock, CompletedBlock, PendingState,
    TrxMrootOrDigests,
};
use crate::domain::protocol_features::{check_protocol_features, trigger_activation_handler};
use crate::domain::resource::ElasticLimitParameters;
use crate::domain::system_actions::{OnBlock, SystemAction};
use crate::error::{ChainError, Result};
use crate::events::emit;
use cc_01_state_store::singleton_key;
use cc_03_fork_database::BlockState;
use shared_types::{
    merkle, system_account, BlockId, BlockTimestamp, Digest, PackedTransaction, PermissionLevel,
    Signature, SignedBlock, TaskFuture, TimePoint, Transaction, TransactionMetadata, TrxType,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Controller {
    /// Start producing a block at `when`, activating every pre-activated
    /// protocol feature.
    pub fn start_block(&mut self, when: BlockTimestamp, confirm_block_count: u16) -> Result<()> {
        let ps: ProtocolStateObject = self.db.get(&singleton_key())?;
        self.start_block_with(
            when,
            confirm_block_count,
            ps.preactivated_protocol_features,
            BlockStatus::Incomplete,
            None,
        )
    }

    /// Open the pending block on top of `head`.
    ///
    /// On failure no pending block remains.
    pub fn start_block_with(
        &mut self,
        when: BlockTimestamp,
        confirm_block_count: u16,
        new_protocol_feature_activations: Vec<Digest>,
        status: BlockStatus,
        producer_block_id: Option<BlockId>,
    ) -> Result<()> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        let head_num = self.head.block_num();
        emit(&self.signals.block_start, &(head_num + 1))?;

        if self.db.revision() != head_num as u64 {
            return Err(ChainError::Fatal(format!(
                "database revision ({}) is not on par with head block ({head_num})",
                self.db.revision()
            )));
        }

        let session = if self.skip_db_sessions_for(status) {
            self.db.make_no_op_session()
        } else {
            self.db.make_session()
        };
        let pbhs = self.head.header_state.next(Some(when), confirm_block_count)?;
        let building = BuildingBlock::new(pbhs, new_protocol_feature_activations, None);
        self.pending = Some(PendingState::new(session, building, status, producer_block_id));

        let executes_content =
            self.config.read_mode == DbReadMode::Speculative || status != BlockStatus::Incomplete;
        if executes_content {
            if let Err(e) = self.prepare_pending_block() {
                self.abort_block();
                return Err(e);
            }
        }
        debug!(block_num = head_num + 1, ?status, "[cc-04] block started");
        Ok(())
    }

    /// Feature activations, schedule promotion, onblock and dedup cleanup.
    fn prepare_pending_block(&mut self) -> Result<()> {
        self.activate_new_protocol_features()?;
        self.promote_proposed_schedule()?;
        self.apply_onblock()?;
        self.clear_expired_input_transactions()
    }

    fn activate_new_protocol_features(&mut self) -> Result<()> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let building = pending.building()?;
        let pbhs = &building.pending_block_header_state;
        let block_num = pbhs.block_num();
        let new_features = building.new_protocol_feature_activations.clone();
        let ps: ProtocolStateObject = self.db.get(&singleton_key())?;
        let set = self.protocol_features.set().clone();

        let mut num_preactivated_activated = 0;
        if !new_features.is_empty() {
            check_protocol_features(
                &set,
                pbhs.timestamp,
                &pbhs.prev_activated_protocol_features.protocol_features,
                &new_features,
            )?;
            for digest in &new_features {
                let feature = set.get(digest)?;
                let preactivated = ps.preactivated_protocol_features.contains(digest);
                if feature.preactivation_required && !preactivated {
                    return Err(ChainError::ProtocolFeature(format!(
                        "attempted to activate protocol feature without prior required preactivation: {digest}"
                    )));
                }
                if preactivated {
                    num_preactivated_activated += 1;
                }
            }
        }
        if num_preactivated_activated != ps.preactivated_protocol_features.len() {
            return Err(ChainError::BlockValidate(
                "There are pre-activated protocol features that were not activated at the start of this block"
                    .into(),
            ));
        }
        if new_features.is_empty() {
            return Ok(());
        }

        self.db.modify::<ProtocolStateObject, _>(&singleton_key(), |ps| {
            ps.preactivated_protocol_features.clear();
            for digest in &new_features {
                ps.activated_protocol_features.push(ActivatedProtocolFeature {
                    feature_digest: *digest,
                    activation_block_num: block_num,
                });
            }
        })?;
        for digest in &new_features {
            trigger_activation_handler(&set, digest, &self.db)?;
            self.protocol_features.activate_feature(*digest, block_num)?;
            if let Some(pending) = self.pending.as_mut() {
                pending.building_mut()?.num_new_protocol_features_activated += 1;
            }
            info!(feature = %digest, block_num, "[cc-04] protocol feature activated");
        }
        Ok(())
    }

    /// Move the proposed schedule to pending once its proposal block is
    /// irreversible.
    fn promote_proposed_schedule(&mut self) -> Result<()> {
        let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
        let Some(proposed_num) = gpo.proposed_schedule_block_num else {
            return Ok(());
        };
        let replaying = self.replaying;
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;
        let building = pending.building_mut()?;
        let pbhs = &building.pending_block_header_state;
        if proposed_num > pbhs.common.dpos_irreversible_blocknum
            || !pbhs.prev_pending_schedule.schedule.producers.is_empty()
            || pbhs.was_pending_promoted
        {
            return Ok(());
        }
        if gpo.proposed_schedule.version != pbhs.active_schedule_version + 1 {
            return Err(ChainError::ProducerSchedule("wrong producer schedule version specified".into()));
        }
        if !replaying {
            info!(
                version = gpo.proposed_schedule.version,
                lib = pbhs.common.dpos_irreversible_blocknum,
                block_num = pbhs.block_num(),
                "[cc-04] promoting proposed schedule to pending"
            );
        }
        building.new_pending_producer_schedule = Some(gpo.proposed_schedule);
        self.db.modify::<GlobalPropertyObject, _>(&singleton_key(), |g| {
            g.proposed_schedule_block_num = None;
            g.proposed_schedule = Default::default();
        })?;
        Ok(())
    }

    /// Run the implicit onblock transaction. Only resource exhaustion stops
    /// the block; any other failure is logged.
    fn apply_onblock(&mut self) -> Result<()> {
        let onblock = self.onblock_transaction()?;
        let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
        self.in_trx_requiring_checks = true;
        let result = self.push_transaction(
            onblock,
            TimePoint::MAX,
            gpo.configuration.min_transaction_cpu_usage,
            true,
        );
        self.in_trx_requiring_checks = false;
        match result {
            Ok(trace) => {
                if let Some(except) = &trace.except {
                    warn!(error = %except.message, "[cc-04] onblock failed");
                }
                Ok(())
            }
            Err(e) if e.is_resource_exhaustion() => Err(e),
            Err(e) => {
                warn!(error = %e, "[cc-04] onblock failed");
                Ok(())
            }
        }
    }

    fn onblock_transaction(&self) -> Result<Arc<TransactionMetadata>> {
        let pending_time = self.pending_block_time()?;
        let action = OnBlock {
            header: self.head.header_state.header.clone(),
        }
        .to_action(vec![PermissionLevel::new(system_account().as_str(), "active")]);
        let mut trx = Transaction {
            actions: vec![action],
            ..Default::default()
        };
        // rounded up to the next second
        trx.header.expiration = pending_time.add_micros(999_999).into();
        trx.set_reference_block(&self.head.id());
        Ok(TransactionMetadata::create_no_recover_keys(
            Arc::new(PackedTransaction::new(trx)),
            TrxType::Implicit,
        ))
    }

    /// Drop dedup entries that expired before the pending block time.
    fn clear_expired_input_transactions(&mut self) -> Result<()> {
        let now = self.pending_block_time()?;
        let mut removed = 0usize;
        for trx in self.db.all::<TransactionObject>()? {
            if now > trx.expiration.to_time_point() {
                self.db.remove::<TransactionObject>(trx.trx_id.as_bytes())?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "[cc-04] expired transactions cleared");
        }
        Ok(())
    }

    /// Settle resource bookkeeping, compute the merkle roots and assemble
    /// the unsigned block.
    pub fn finalize_block(&mut self) -> Result<()> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let building = match &pending.block_stage {
            BlockStage::Building(b) => b,
            other => {
                return Err(ChainError::BlockStage(match other {
                    BlockStage::Assembled(_) => "block is already assembled",
                    _ => "block is already completed",
                }))
            }
        };
        let block_num = building.pending_block_header_state.block_num();

        let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
        let rl = &self.resource_limits;
        rl.process_account_limit_updates()?;
        rl.set_block_parameters(
            ElasticLimitParameters::cpu(&gpo.configuration),
            ElasticLimitParameters::net(&gpo.configuration),
        )?;
        rl.process_block_usage(block_num)?;

        let action_digests = building.action_receipt_digests.clone();
        let action_mroot_future = self.thread_pool.post(move || merkle(action_digests));
        let trx_mroot_future = match &building.trx_mroot_or_receipt_digests {
            TrxMrootOrDigests::Mroot(m) => TaskFuture::ready(*m),
            TrxMrootOrDigests::Digests(digests) => {
                let digests = digests.clone();
                self.thread_pool.post(move || merkle(digests))
            }
        };
        let action_mroot = action_mroot_future.wait()?;
        let trx_mroot = trx_mroot_future.wait()?;

        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;
        let building = pending.building_mut()?;
        let header = building.pending_block_header_state.make_block_header(
            trx_mroot,
            action_mroot,
            building.new_pending_producer_schedule.clone(),
            building.new_protocol_feature_activations.clone(),
        );
        let id = header.calculate_id();
        let assembled = AssembledBlock {
            id,
            pending_block_header_state: building.pending_block_header_state.clone(),
            trx_metas: std::mem::take(&mut building.pending_trx_metas),
            unsigned_block: SignedBlock {
                header,
                producer_signature: Signature::default(),
                transactions: std::mem::take(&mut building.pending_trx_receipts),
            },
        };
        pending.block_stage = BlockStage::Assembled(assembled);

        // TaPoS ring
        self.db.put(&BlockSummaryObject {
            slot: (block_num & 0xffff) as u16,
            block_id: id,
        })?;
        debug!(block_num, id = %id, "[cc-04] block assembled");
        Ok(())
    }

    /// Sign the assembled block with the producer key.
    pub fn sign_block(&mut self, signer: &dyn Fn(&Digest) -> Signature) -> Result<()> {
        let validator = self.feature_validator();
        let pending = self.pending.as_mut().ok_or(ChainError::NoPendingBlock)?;
        let BlockStage::Assembled(assembled) = &pending.block_stage else {
            return Err(ChainError::BlockStage("sign_block requires an assembled block"));
        };
        let bsp = BlockState::from_pending::<ChainError>(
            assembled.pending_block_header_state.clone(),
            assembled.unsigned_block.clone(),
            assembled.trx_metas.clone(),
            &validator,
            signer,
        )?;
        pending.block_stage = BlockStage::Completed(CompletedBlock {
            block_state: Arc::new(bsp),
        });
        Ok(())
    }

    /// Make the completed pending block the new head.
    ///
    /// No pending block remains afterwards, whether or not this succeeds.
    pub fn commit_block(&mut self) -> Result<()> {
        self.commit_block_internal(true)
    }

    pub(super) fn commit_block_internal(&mut self, add_to_fork_db: bool) -> Result<()> {
        let result = self.try_commit_block(add_to_fork_db);
        if result.is_err() {
            self.abort_block();
        }
        result
    }

    fn try_commit_block(&mut self, add_to_fork_db: bool) -> Result<()> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let BlockStage::Completed(completed) = &pending.block_stage else {
            return Err(ChainError::BlockStage("cannot commit a block that is not completed"));
        };
        let bsp = completed.block_state.clone();
        let block_num = bsp.block_num();

        if add_to_fork_db {
            self.fork_db.add(bsp.clone(), false)?;
            self.fork_db.mark_valid(&bsp)?;
            emit(&self.signals.accepted_block_header, &bsp)?;
            if self.fork_db.head().map(|h| h.id()) != Some(bsp.id()) {
                return Err(ChainError::Fatal(
                    "committed block did not become the new head in fork database".into(),
                ));
            }
        }

        if !self.replaying && self.config.read_mode != DbReadMode::Irreversible {
            self.reversible_blocks.add(&bsp.block)?;
        }

        self.head = bsp.clone();
        if let Some(mut pending) = self.pending.take() {
            pending.push();
        }
        if self.db.revision() < block_num as u64 && self.db.undo_depth() == 0 {
            self.db.set_revision(block_num as u64)?;
        }

        emit(&self.signals.accepted_block, &bsp)?;
        if add_to_fork_db {
            self.log_irreversible()?;
        }
        debug!(block_num, id = %bsp.id(), "[cc-04] block committed");
        Ok(())
    }

    /// Discard the pending block and return the metadata of the
    /// transactions it held.
    pub fn abort_block(&mut self) -> Vec<Arc<TransactionMetadata>> {
        let Some(pending) = self.pending.take() else {
            return Vec::new();
        };
        let metas = pending.extract_trx_metas();
        self.protocol_features.popped_blocks_to(self.head.block_num());
        debug!(returned = metas.len(), "[cc-04] pending block aborted");
        metas
    }
}
