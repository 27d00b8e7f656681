//! # Controller Errors
//!
//! Every failure the controller can surface, plus the classification that
//! decides whether a failure is recorded in a transaction trace or aborts
//! the block.
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | Subjective | deadline, block CPU/NET, blacklists | trace only, may differ between nodes |
//! | Objective | auth, RAM, contract assertion | trace + receipt, identical on all nodes |
//! | Objective block validation | receipt mismatch, disallowed extensions | always propagates |
//! | Resource exhaustion | allocator exhaustion, fatal observer | always propagates |

use cc_01_state_store::StateError;
use cc_02_block_log::BlockLogError;
use cc_03_fork_database::ForkDbError;
use shared_bus::HandlerError;
use shared_types::{AccountName, BlockId, ExceptionDetails, PublicKey, TransactionId, TypeError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChainError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    // --- pending block lifecycle ---
    #[error("pending block already exists")]
    PendingBlockExists,

    #[error("no pending block")]
    NoPendingBlock,

    #[error("pending block stage: {0}")]
    BlockStage(&'static str),

    // --- block validation ---
    #[error("block validation failed: {0}")]
    BlockValidate(String),

    #[error("objective block validation failed: {0}")]
    ObjectiveBlockValidation(String),

    #[error("unlinkable block {id}")]
    UnlinkableBlock { id: BlockId },

    #[error("protocol feature: {0}")]
    ProtocolFeature(String),

    #[error("producer schedule: {0}")]
    ProducerSchedule(String),

    // --- transaction validation ---
    #[error("deadline cannot be uninitialized")]
    MissingDeadline,

    #[error("transaction has expired")]
    ExpiredTransaction,

    #[error("transaction expiration is too far in the future")]
    ExpirationTooFar,

    #[error("transaction's reference block did not match")]
    InvalidRefBlock,

    #[error("duplicate transaction {id}")]
    DuplicateTransaction { id: TransactionId },

    #[error("transaction has no authorizations")]
    TxNoAuths,

    #[error("transaction includes extensions that are not supported")]
    TransactionExtensions,

    #[error("this transaction isn't ready")]
    TransactionNotReady,

    #[error("unknown scheduled transaction {id}")]
    UnknownTransaction { id: TransactionId },

    #[error("transaction delay exceeds the maximum allowed")]
    DelayTooLong,

    #[error("deferred transaction with the same sender_id and payer already exists")]
    DeferredTxDuplicate,

    #[error("transaction: {0}")]
    Transaction(String),

    // --- authorization ---
    #[error("unsatisfied authorization: {0}")]
    UnsatisfiedAuthorization(String),

    #[error("missing authority of {account}")]
    MissingAuth { account: AccountName },

    #[error("transaction bears irrelevant signatures from these keys: {0:?}")]
    IrrelevantSignatures(Vec<PublicKey>),

    #[error("permission {0} does not exist")]
    UnknownPermission(String),

    // --- resources ---
    #[error("transaction exceeded the current CPU usage limit imposed on the transaction")]
    TxCpuUsageExceeded,

    #[error("transaction net usage is too high: {used} > {limit}")]
    TxNetUsageExceeded { used: u64, limit: u64 },

    #[error("the transaction was unable to complete by deadline")]
    Deadline,

    #[error("transaction was not executed within the subjective CPU leeway")]
    LeewayDeadline,

    #[error("transaction CPU usage exceeds the remaining block CPU")]
    BlockCpuUsageExceeded,

    #[error("transaction net usage exceeds the remaining block net")]
    BlockNetUsageExceeded,

    #[error("greylisted account CPU usage exceeded")]
    GreylistCpuUsageExceeded,

    #[error("greylisted account net usage exceeded")]
    GreylistNetUsageExceeded,

    #[error("account {account} has insufficient ram; needs {needed} bytes has {available} bytes")]
    RamUsageExceeded {
        account: AccountName,
        needed: i64,
        available: i64,
    },

    #[error("inline action too big: {size} > {limit}")]
    InlineActionTooBig { size: u64, limit: u64 },

    #[error("max inline action depth exceeded")]
    InlineActionDepth,

    // --- black/white lists ---
    #[error("authorizing actor {0} is blacklisted")]
    ActorBlacklisted(AccountName),

    #[error("authorizing actor {0} is not on the whitelist")]
    ActorWhitelist(AccountName),

    #[error("account {0} is on the contract blacklist")]
    ContractBlacklisted(AccountName),

    #[error("account {0} is not on the contract whitelist")]
    ContractWhitelist(AccountName),

    #[error("action {0}::{1} is on the action blacklist")]
    ActionBlacklisted(AccountName, AccountName),

    #[error("public key {0:?} is on the key blacklist")]
    KeyBlacklisted(PublicKey),

    // --- accounts and contracts ---
    #[error("account {0} does not exist")]
    UnknownAccount(AccountName),

    #[error("account {0} already exists")]
    AccountExists(AccountName),

    #[error("action validation: {0}")]
    ActionValidate(String),

    #[error("assertion failure: {0}")]
    ContractAssert(String),

    #[error("contract engine: {0}")]
    Engine(String),

    #[error("{0}")]
    Unauthorized(String),

    // --- startup, persistence, infrastructure ---
    #[error("configuration: {0}")]
    Config(String),

    #[error("database version {found} is not supported (expected {supported})")]
    DatabaseVersion { found: u32, supported: u32 },

    #[error("chain id mismatch: {0}")]
    ChainIdMismatch(String),

    #[error("snapshot: {0}")]
    Snapshot(String),

    #[error("startup: {0}")]
    Startup(String),

    #[error("fatal invariant violation: {0}")]
    Fatal(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    BlockLog(#[from] BlockLogError),

    #[error(transparent)]
    ForkDb(ForkDbError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("signal handler: {0}")]
    Signal(#[from] HandlerError),
}

impl From<ForkDbError> for ChainError {
    fn from(e: ForkDbError) -> Self {
        match e {
            ForkDbError::UnlinkableBlock { id } => ChainError::UnlinkableBlock { id },
            other => ChainError::ForkDb(other),
        }
    }
}

impl ChainError {
    /// Failures that may legitimately differ between producer and validator.
    pub fn is_subjective(&self) -> bool {
        matches!(
            self,
            ChainError::Deadline
                | ChainError::LeewayDeadline
                | ChainError::BlockCpuUsageExceeded
                | ChainError::BlockNetUsageExceeded
                | ChainError::GreylistCpuUsageExceeded
                | ChainError::GreylistNetUsageExceeded
                | ChainError::ActorBlacklisted(_)
                | ChainError::ActorWhitelist(_)
                | ChainError::ContractBlacklisted(_)
                | ChainError::ContractWhitelist(_)
                | ChainError::ActionBlacklisted(..)
                | ChainError::KeyBlacklisted(_)
                | ChainError::InlineActionTooBig { .. }
        )
    }

    /// Subjectivity of a scheduled transaction failure; the transaction CPU
    /// limit counts as subjective too.
    pub fn is_scheduled_subjective(&self) -> bool {
        matches!(self, ChainError::TxCpuUsageExceeded) || self.is_subjective()
    }

    pub fn is_objective_block_validation(&self) -> bool {
        matches!(self, ChainError::ObjectiveBlockValidation(_))
    }

    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            ChainError::ResourceExhausted(_) | ChainError::Signal(HandlerError::Fatal(_))
        )
    }

    /// Never captured into a trace.
    pub fn must_propagate(&self) -> bool {
        self.is_resource_exhaustion() || self.is_objective_block_validation()
    }

    pub fn code(&self) -> u64 {
        match self {
            ChainError::PendingBlockExists
            | ChainError::NoPendingBlock
            | ChainError::BlockStage(_)
            | ChainError::BlockValidate(_) => 3_030_000,
            ChainError::UnlinkableBlock { .. } => 3_030_001,
            ChainError::ObjectiveBlockValidation(_) => 3_030_100,
            ChainError::ProtocolFeature(_) => 3_250_000,
            ChainError::ProducerSchedule(_) => 3_200_000,
            ChainError::MissingDeadline => 3_040_000,
            ChainError::ExpiredTransaction => 3_040_005,
            ChainError::ExpirationTooFar => 3_040_006,
            ChainError::InvalidRefBlock => 3_040_007,
            ChainError::DuplicateTransaction { .. } => 3_040_008,
            ChainError::TxNoAuths => 3_040_003,
            ChainError::TransactionExtensions => 3_040_015,
            ChainError::TransactionNotReady => 3_040_011,
            ChainError::UnknownTransaction { .. } => 3_040_012,
            ChainError::DelayTooLong => 3_040_013,
            ChainError::DeferredTxDuplicate => 3_040_009,
            ChainError::Transaction(_) => 3_040_001,
            ChainError::UnsatisfiedAuthorization(_) => 3_090_003,
            ChainError::MissingAuth { .. } => 3_090_004,
            ChainError::IrrelevantSignatures(_) => 3_090_005,
            ChainError::UnknownPermission(_) => 3_090_006,
            ChainError::TxCpuUsageExceeded => 3_080_004,
            ChainError::TxNetUsageExceeded { .. } => 3_080_002,
            ChainError::Deadline => 3_080_006,
            ChainError::LeewayDeadline => 3_081_001,
            ChainError::BlockCpuUsageExceeded => 3_080_005,
            ChainError::BlockNetUsageExceeded => 3_080_003,
            ChainError::GreylistCpuUsageExceeded => 3_080_008,
            ChainError::GreylistNetUsageExceeded => 3_080_007,
            ChainError::RamUsageExceeded { .. } => 3_080_001,
            ChainError::InlineActionTooBig { .. } => 3_050_009,
            ChainError::InlineActionDepth => 3_050_010,
            ChainError::ActorBlacklisted(_) => 3_130_003,
            ChainError::ActorWhitelist(_) => 3_130_002,
            ChainError::ContractBlacklisted(_) => 3_130_005,
            ChainError::ContractWhitelist(_) => 3_130_004,
            ChainError::ActionBlacklisted(..) => 3_130_006,
            ChainError::KeyBlacklisted(_) => 3_130_007,
            ChainError::UnknownAccount(_) => 3_060_002,
            ChainError::AccountExists(_) => 3_050_001,
            ChainError::ActionValidate(_) => 3_050_002,
            ChainError::ContractAssert(_) => 3_050_003,
            ChainError::Engine(_) => 3_070_000,
            ChainError::Unauthorized(_) => 3_090_001,
            ChainError::Config(_) => 3_170_000,
            ChainError::DatabaseVersion { .. } => 3_060_100,
            ChainError::ChainIdMismatch(_) => 3_060_101,
            ChainError::Snapshot(_) => 3_170_100,
            ChainError::Startup(_) => 3_170_200,
            ChainError::Fatal(_) => 3_000_001,
            ChainError::ResourceExhausted(_) => 3_000_002,
            ChainError::State(_) => 3_060_000,
            ChainError::BlockLog(_) => 3_190_000,
            ChainError::ForkDb(_) => 3_020_000,
            ChainError::Type(_) => 3_010_000,
            ChainError::Signal(_) => 3_000_003,
        }
    }

    /// Variant name, recorded in traces.
    pub fn name(&self) -> &'static str {
        match self {
            ChainError::Deadline => "deadline_exception",
            ChainError::LeewayDeadline => "leeway_deadline_exception",
            ChainError::TxCpuUsageExceeded => "tx_cpu_usage_exceeded",
            ChainError::BlockCpuUsageExceeded => "block_cpu_usage_exceeded",
            ChainError::BlockNetUsageExceeded => "block_net_usage_exceeded",
            ChainError::TxNetUsageExceeded { .. } => "tx_net_usage_exceeded",
            ChainError::RamUsageExceeded { .. } => "ram_usage_exceeded",
            ChainError::ExpiredTransaction => "expired_tx_exception",
            ChainError::DuplicateTransaction { .. } => "tx_duplicate",
            ChainError::UnsatisfiedAuthorization(_) => "unsatisfied_authorization",
            ChainError::MissingAuth { .. } => "missing_auth_exception",
            ChainError::ContractAssert(_) => "eosio_assert_message_exception",
            ChainError::ObjectiveBlockValidation(_) => "objective_block_validation_exception",
            ChainError::ProtocolFeature(_) => "protocol_feature_exception",
            _ if self.is_subjective() => "subjective_exception",
            _ => "chain_exception",
        }
    }

    pub fn details(&self) -> ExceptionDetails {
        ExceptionDetails {
            code: self.code(),
            name: self.name().to_string(),
            message: self.to_string(),
        }
    }
}
