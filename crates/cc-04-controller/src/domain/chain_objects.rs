//! Consensus rows kept in the state store.

use crate::config::ChainConfig;
use cc_01_state_store::{singleton_key, Record};
use serde::{Deserialize, Serialize};
use shared_types::{
    AccountName, BlockId, BlockTimestamp, ChainId, Digest, ProducerSchedule, TimePoint,
    TimePointSec, TransactionId,
};
use std::collections::BTreeSet;

/// Version of the row layout; bumped when a record changes shape.
pub const DATABASE_VERSION: u32 = 1;

fn name_key(name: &AccountName) -> Vec<u8> {
    name.as_str().as_bytes().to_vec()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseHeaderObject {
    pub version: u32,
}

impl Record for DatabaseHeaderObject {
    const TABLE: &'static str = "database_header";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPropertyObject {
    pub proposed_schedule_block_num: Option<u32>,
    pub proposed_schedule: ProducerSchedule,
    pub configuration: ChainConfig,
    pub chain_id: ChainId,
}

impl Record for GlobalPropertyObject {
    const TABLE: &'static str = "global_property";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicGlobalPropertyObject {
    pub global_action_sequence: u64,
}

impl Record for DynamicGlobalPropertyObject {
    const TABLE: &'static str = "dynamic_global_property";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

/// TaPoS ring entry for `block_num & 0xffff`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummaryObject {
    pub slot: u16,
    pub block_id: BlockId,
}

impl BlockSummaryObject {
    pub fn key(slot: u16) -> Vec<u8> {
        slot.to_be_bytes().to_vec()
    }
}

impl Record for BlockSummaryObject {
    const TABLE: &'static str = "block_summary";
    fn key_bytes(&self) -> Vec<u8> {
        Self::key(self.slot)
    }
}

/// Dedup entry for an input transaction until it expires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionObject {
    pub trx_id: TransactionId,
    pub expiration: TimePointSec,
}

impl Record for TransactionObject {
    const TABLE: &'static str = "transaction";
    fn key_bytes(&self) -> Vec<u8> {
        self.trx_id.as_bytes().to_vec()
    }
}

/// A deferred transaction waiting for `delay_until`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedTransactionObject {
    pub trx_id: TransactionId,
    /// Empty for delayed input transactions.
    pub sender: AccountName,
    pub sender_id: u128,
    pub payer: AccountName,
    pub delay_until: TimePoint,
    pub expiration: TimePoint,
    pub published: TimePoint,
    /// bincode-encoded `Transaction`.
    pub packed_trx: Vec<u8>,
}

impl GeneratedTransactionObject {
    /// RAM charged to the payer while the row exists.
    pub fn billable_size(&self) -> i64 {
        GENERATED_TRANSACTION_OVERHEAD + self.packed_trx.len() as i64
    }
}

pub const GENERATED_TRANSACTION_OVERHEAD: i64 = 96;

impl Record for GeneratedTransactionObject {
    const TABLE: &'static str = "generated_transaction";
    fn key_bytes(&self) -> Vec<u8> {
        self.trx_id.as_bytes().to_vec()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivatedProtocolFeature {
    pub feature_digest: Digest,
    pub activation_block_num: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStateObject {
    pub activated_protocol_features: Vec<ActivatedProtocolFeature>,
    pub preactivated_protocol_features: Vec<Digest>,
    /// Host functions contracts may call.
    pub whitelisted_intrinsics: BTreeSet<String>,
}

impl Record for ProtocolStateObject {
    const TABLE: &'static str = "protocol_state";
    fn key_bytes(&self) -> Vec<u8> {
        singleton_key()
    }
}

pub const OVERHEAD_PER_ACCOUNT_RAM_BYTES: i64 = 2 * 1024;
pub const SETCODE_RAM_BYTES_MULTIPLIER: i64 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountObject {
    pub name: AccountName,
    pub creation_date: BlockTimestamp,
    pub privileged: bool,
    /// Zero when no contract is deployed.
    pub code_hash: Digest,
    pub code_sequence: u32,
    pub recv_sequence: u64,
    pub auth_sequence: u64,
    pub last_code_update: TimePoint,
}

impl AccountObject {
    pub fn key(name: &AccountName) -> Vec<u8> {
        name_key(name)
    }
}

impl Record for AccountObject {
    const TABLE: &'static str = "account";
    fn key_bytes(&self) -> Vec<u8> {
        name_key(&self.name)
    }
}

/// Deployed contract code, shared by every account with the same hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeObject {
    pub code_hash: Digest,
    pub code: Vec<u8>,
    pub code_ref_count: u64,
    pub first_block_used: u32,
}

impl Record for CodeObject {
    const TABLE: &'static str = "code";
    fn key_bytes(&self) -> Vec<u8> {
        self.code_hash.as_bytes().to_vec()
    }
}

/// One row of a contract table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractRowObject {
    pub code: AccountName,
    pub table: AccountName,
    pub primary_key: u64,
    pub payer: AccountName,
    pub value: Vec<u8>,
}

pub const BILLABLE_ROW_OVERHEAD: i64 = 112;

impl ContractRowObject {
    pub fn key(code: &AccountName, table: &AccountName, primary_key: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(code.as_str().len() + table.as_str().len() + 10);
        key.extend_from_slice(code.as_str().as_bytes());
        key.push(0);
        key.extend_from_slice(table.as_str().as_bytes());
        key.push(0);
        key.extend_from_slice(&primary_key.to_be_bytes());
        key
    }

    pub fn billable_size(&self) -> i64 {
        BILLABLE_ROW_OVERHEAD + self.value.len() as i64
    }
}

impl Record for ContractRowObject {
    const TABLE: &'static str = "contract_row";
    fn key_bytes(&self) -> Vec<u8> {
        Self::key(&self.code, &self.table, self.primary_key)
    }
}
