//! Fork database node: a header state plus the full block.

use super::errors::ForkDbError;
use super::header_state::{BlockHeaderState, FeatureValidator, PendingBlockHeaderState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_types::{BlockId, Digest, Signature, SignedBlock, TransactionMetadata};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct BlockState {
    pub header_state: BlockHeaderState,
    pub block: Arc<SignedBlock>,
    validated: AtomicBool,
    /// Metadata of the transactions in `block`, when known locally.
    cached_trxs: Mutex<Vec<Arc<TransactionMetadata>>>,
}

pub type BlockStatePtr = Arc<BlockState>;

impl BlockState {
    /// Wrap a header state that needs no further validation (roots, genesis).
    pub fn from_header_state(header_state: BlockHeaderState, block: Arc<SignedBlock>) -> Self {
        Self {
            header_state,
            block,
            validated: AtomicBool::new(true),
            cached_trxs: Mutex::new(Vec::new()),
        }
    }

    /// State of a received block built on `prev`.
    pub fn from_block<E: From<ForkDbError>>(
        prev: &BlockHeaderState,
        block: Arc<SignedBlock>,
        validator: FeatureValidator<'_, E>,
        skip_validate_signee: bool,
    ) -> Result<Self, E> {
        let header_state = prev.next_from_header(
            &block.header,
            &block.producer_signature,
            validator,
            skip_validate_signee,
        )?;
        Ok(Self {
            header_state,
            block,
            validated: AtomicBool::new(false),
            cached_trxs: Mutex::new(Vec::new()),
        })
    }

    /// Finish, sign and wrap a locally produced block.
    pub fn from_pending<E: From<ForkDbError>>(
        pending: PendingBlockHeaderState,
        mut block: SignedBlock,
        trx_metas: Vec<Arc<TransactionMetadata>>,
        validator: FeatureValidator<'_, E>,
        signer: &dyn Fn(&Digest) -> Signature,
    ) -> Result<Self, E> {
        let header_state = pending.finish_next(&block.header, validator, signer)?;
        block.producer_signature = header_state.producer_signature.clone();
        Ok(Self {
            header_state,
            block: Arc::new(block),
            validated: AtomicBool::new(false),
            cached_trxs: Mutex::new(trx_metas),
        })
    }

    pub fn id(&self) -> BlockId {
        self.header_state.id
    }

    pub fn block_num(&self) -> u32 {
        self.header_state.block_num()
    }

    pub fn previous(&self) -> &BlockId {
        self.header_state.previous()
    }

    pub fn dpos_irreversible_blocknum(&self) -> u32 {
        self.header_state.dpos_irreversible_blocknum()
    }

    pub fn is_valid(&self) -> bool {
        self.validated.load(Ordering::Acquire)
    }

    pub(crate) fn set_valid(&self, valid: bool) {
        self.validated.store(valid, Ordering::Release);
    }

    pub fn trxs_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        self.cached_trxs.lock().clone()
    }

    pub fn set_trxs_metas(&self, metas: Vec<Arc<TransactionMetadata>>) {
        *self.cached_trxs.lock() = metas;
    }

    /// Take the cached metadata, leaving the cache empty.
    pub fn extract_trxs_metas(&self) -> Vec<Arc<TransactionMetadata>> {
        std::mem::take(&mut *self.cached_trxs.lock())
    }
}

/// Persisted form of a block state.
#[derive(Serialize, Deserialize)]
pub(crate) struct StoredBlockState {
    pub header_state: BlockHeaderState,
    pub block: SignedBlock,
    pub validated: bool,
}

impl From<&BlockState> for StoredBlockState {
    fn from(b: &BlockState) -> Self {
        Self {
            header_state: b.header_state.clone(),
            block: (*b.block).clone(),
            validated: b.is_valid(),
        }
    }
}

impl From<StoredBlockState> for BlockState {
    fn from(s: StoredBlockState) -> Self {
        let state = BlockState::from_header_state(s.header_state, Arc::new(s.block));
        state.set_valid(s.validated);
        state
    }
}
