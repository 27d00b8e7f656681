//! # Execution Traces
//!
//! What happened while a transaction ran. Failed transactions return a
//! trace with `except` set instead of an error.

use crate::block::TransactionReceiptHeader;
use crate::primitives::{AccountName, BlockId, BlockTimestamp, Digest, TransactionId};
use crate::transaction::Action;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    pub code: u64,
    pub name: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReceipt {
    pub receiver: AccountName,
    pub act_digest: Digest,
    pub global_sequence: u64,
    pub recv_sequence: u64,
    pub code_sequence: u32,
}

impl ActionReceipt {
    pub fn digest(&self) -> Digest {
        Digest::hash_of(self)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub action_ordinal: u32,
    pub creator_action_ordinal: u32,
    pub receiver: AccountName,
    pub act: Action,
    pub context_free: bool,
    pub elapsed_us: i64,
    pub console: String,
    pub receipt: Option<ActionReceipt>,
    pub except: Option<ExceptionDetails>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: TransactionId,
    pub block_num: u32,
    pub block_time: BlockTimestamp,
    pub producer_block_id: Option<BlockId>,
    pub receipt: Option<TransactionReceiptHeader>,
    pub elapsed_us: i64,
    pub net_usage: u64,
    pub scheduled: bool,
    pub action_traces: Vec<ActionTrace>,
    pub account_ram_delta: Option<(AccountName, i64)>,
    pub failed_dtrx_trace: Option<Box<TransactionTrace>>,
    pub except: Option<ExceptionDetails>,
}

impl TransactionTrace {
    pub fn succeeded(&self) -> bool {
        self.except.is_none()
    }
}
