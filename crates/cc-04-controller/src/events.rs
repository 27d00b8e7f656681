//! # Controller Signals
//!
//! Observers attach to these before startup. Emission order for a block:
//!
//! ```text
//! block_start ─► accepted_transaction* / applied_transaction* ─► accepted_block_header
//!             ─► accepted_block ─► irreversible_block*
//! pre_accepted_block fires for blocks received from the network before validation.
//! ```

use crate::error::Result;
use cc_03_fork_database::BlockStatePtr;
use shared_bus::Signal;
use shared_types::{PackedTransaction, SignedBlock, TransactionMetadata, TransactionTrace};
use std::sync::Arc;

pub type AppliedTransaction = (Arc<TransactionTrace>, Arc<PackedTransaction>);

#[derive(Debug)]
pub struct ControllerSignals {
    /// Block number of the block being started.
    pub block_start: Signal<u32>,
    pub pre_accepted_block: Signal<Arc<SignedBlock>>,
    pub accepted_block_header: Signal<BlockStatePtr>,
    pub accepted_block: Signal<BlockStatePtr>,
    pub irreversible_block: Signal<BlockStatePtr>,
    pub accepted_transaction: Signal<Arc<TransactionMetadata>>,
    pub applied_transaction: Signal<AppliedTransaction>,
}

impl Default for ControllerSignals {
    fn default() -> Self {
        Self {
            block_start: Signal::new("block_start"),
            pre_accepted_block: Signal::new("pre_accepted_block"),
            accepted_block_header: Signal::new("accepted_block_header"),
            accepted_block: Signal::new("accepted_block"),
            irreversible_block: Signal::new("irreversible_block"),
            accepted_transaction: Signal::new("accepted_transaction"),
            applied_transaction: Signal::new("applied_transaction"),
        }
    }
}

/// Emit and turn a fatal handler failure into a controller error.
pub(crate) fn emit<T: Clone + Send + 'static>(signal: &Signal<T>, value: &T) -> Result<()> {
    signal.emit(value)?;
    Ok(())
}
