//! # Pending Block
//!
//! The block under construction moves through three stages, one way:
//!
//! ```text
//!   start_block ──► Building ──finalize_block──► Assembled ──sign / match──► Completed
//!                      │                             │                          │
//!                      └────────── abort_block ──────┴────── commit_block ──────┘
//! ```
//!
//! Each stage is a variant of `BlockStage`; data that only exists in one
//! stage is only reachable through that variant.

use crate::error::{ChainError, Result};
use cc_01_state_store::Session;
use cc_03_fork_database::{BlockStatePtr, PendingBlockHeaderState};
use shared_types::{
    AccountName, BlockId, BlockTimestamp, Digest, ProducerSchedule, SignedBlock,
    TransactionMetadata, TransactionReceipt,
};
use std::sync::Arc;

/// How much the controller trusts the block being applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Already irreversible; replayed from the block log.
    Irreversible,
    /// Validated before (reversible replay).
    Validated,
    /// Received from the network, not yet validated.
    Complete,
    /// Being produced locally.
    Incomplete,
}

/// Transaction merkle source: computed from receipts, or already known
/// from a block being replayed.
#[derive(Clone, Debug)]
pub enum TrxMrootOrDigests {
    Mroot(Digest),
    Digests(Vec<Digest>),
}

#[derive(Debug)]
pub struct BuildingBlock {
    pub pending_block_header_state: PendingBlockHeaderState,
    pub new_pending_producer_schedule: Option<ProducerSchedule>,
    pub new_protocol_feature_activations: Vec<Digest>,
    /// How many of `new_protocol_feature_activations` have taken effect.
    pub num_new_protocol_features_activated: usize,
    pub pending_trx_metas: Vec<Arc<TransactionMetadata>>,
    pub pending_trx_receipts: Vec<TransactionReceipt>,
    pub trx_mroot_or_receipt_digests: TrxMrootOrDigests,
    pub action_receipt_digests: Vec<Digest>,
}

impl BuildingBlock {
    pub fn new(
        pending_block_header_state: PendingBlockHeaderState,
        new_protocol_feature_activations: Vec<Digest>,
        known_trx_mroot: Option<Digest>,
    ) -> Self {
        Self {
            pending_block_header_state,
            new_pending_producer_schedule: None,
            new_protocol_feature_activations,
            num_new_protocol_features_activated: 0,
            pending_trx_metas: Vec::new(),
            pending_trx_receipts: Vec::new(),
            trx_mroot_or_receipt_digests: match known_trx_mroot {
                Some(m) => TrxMrootOrDigests::Mroot(m),
                None => TrxMrootOrDigests::Digests(Vec::new()),
            },
            action_receipt_digests: Vec::new(),
        }
    }

    pub fn push_receipt(&mut self, receipt: TransactionReceipt) {
        if let TrxMrootOrDigests::Digests(digests) = &mut self.trx_mroot_or_receipt_digests {
            digests.push(receipt.digest());
        }
        self.pending_trx_receipts.push(receipt);
    }

    /// Drop receipts (and their digests) past `receipts`, and action digests
    /// past `actions`.
    pub fn truncate(&mut self, receipts: usize, actions: usize) {
        self.pending_trx_receipts.truncate(receipts);
        if let TrxMrootOrDigests::Digests(digests) = &mut self.trx_mroot_or_receipt_digests {
            digests.truncate(receipts);
        }
        self.action_receipt_digests.truncate(actions);
    }

    /// Active protocol features added by this block so far.
    pub fn activated_features(&self) -> &[Digest] {
        &self.new_protocol_feature_activations[..self.num_new_protocol_features_activated]
    }
}

#[derive(Debug)]
pub struct AssembledBlock {
    pub id: BlockId,
    pub pending_block_header_state: PendingBlockHeaderState,
    pub trx_metas: Vec<Arc<TransactionMetadata>>,
    pub unsigned_block: SignedBlock,
}

#[derive(Debug)]
pub struct CompletedBlock {
    pub block_state: BlockStatePtr,
}

#[derive(Debug)]
pub enum BlockStage {
    Building(BuildingBlock),
    Assembled(AssembledBlock),
    Completed(CompletedBlock),
}

impl BlockStage {
    pub fn name(&self) -> &'static str {
        match self {
            BlockStage::Building(_) => "building",
            BlockStage::Assembled(_) => "assembled",
            BlockStage::Completed(_) => "completed",
        }
    }
}

/// The single pending block plus its state store session.
#[derive(Debug)]
pub struct PendingState {
    db_session: Option<Session>,
    pub block_stage: BlockStage,
    pub block_status: BlockStatus,
    pub producer_block_id: Option<BlockId>,
}

impl PendingState {
    pub fn new(
        db_session: Session,
        building: BuildingBlock,
        block_status: BlockStatus,
        producer_block_id: Option<BlockId>,
    ) -> Self {
        Self {
            db_session: Some(db_session),
            block_stage: BlockStage::Building(building),
            block_status,
            producer_block_id,
        }
    }

    pub fn building(&self) -> Result<&BuildingBlock> {
        match &self.block_stage {
            BlockStage::Building(b) => Ok(b),
            other => Err(ChainError::BlockStage(not_building(other))),
        }
    }

    pub fn building_mut(&mut self) -> Result<&mut BuildingBlock> {
        match &mut self.block_stage {
            BlockStage::Building(b) => Ok(b),
            other => Err(ChainError::BlockStage(not_building(other))),
        }
    }

    pub fn block_num(&self) -> u32 {
        match &self.block_stage {
            BlockStage::Building(b) => b.pending_block_header_state.block_num(),
            BlockStage::Assembled(a) => a.pending_block_header_state.block_num(),
            BlockStage::Completed(c) => c.block_state.block_num(),
        }
    }

    pub fn timestamp(&self) -> BlockTimestamp {
        match &self.block_stage {
            BlockStage::Building(b) => b.pending_block_header_state.timestamp,
            BlockStage::Assembled(a) => a.pending_block_header_state.timestamp,
            BlockStage::Completed(c) => c.block_state.header_state.timestamp(),
        }
    }

    pub fn producer(&self) -> AccountName {
        match &self.block_stage {
            BlockStage::Building(b) => b.pending_block_header_state.producer.clone(),
            BlockStage::Assembled(a) => a.pending_block_header_state.producer.clone(),
            BlockStage::Completed(c) => c.block_state.header_state.header.producer.clone(),
        }
    }

    /// Metadata of every transaction applied to this block.
    pub fn extract_trx_metas(self) -> Vec<Arc<TransactionMetadata>> {
        match self.block_stage {
            BlockStage::Building(b) => b.pending_trx_metas,
            BlockStage::Assembled(a) => a.trx_metas,
            BlockStage::Completed(c) => c.block_state.extract_trxs_metas(),
        }
    }

    /// Keep the block's writes as one undo level.
    pub fn push(&mut self) {
        if let Some(session) = self.db_session.take() {
            session.push();
        }
    }
}

fn not_building(stage: &BlockStage) -> &'static str {
    match stage {
        BlockStage::Building(_) => "building",
        BlockStage::Assembled(_) => "not valid in the assembled stage",
        BlockStage::Completed(_) => "not valid in the completed stage",
    }
}
