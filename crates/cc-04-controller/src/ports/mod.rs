//! # Ports
//!
//! Collaborators the controller drives but does not implement itself.
//! Default state-store backed adapters live in `crate::adapters`; a node
//! can plug in its own.
//!
//! All methods take `&self`: implementations write through the shared
//! `Database` handle, so their writes belong to whatever undo session is
//! open and are reverted with it.

use crate::apply_context::ApplyContext;
use crate::domain::{AccountResourceLimits, Authority, ElasticLimitParameters, PermissionObject};
use crate::error::Result;
use shared_types::{AccountName, Action, Digest, PermissionLevel, PublicKey, TimePoint};
use std::collections::BTreeSet;

/// RAM, NET and CPU accounting.
pub trait ResourceLimitsManager: Send + Sync {
    /// Create the config and state rows of a fresh chain.
    fn initialize_database(&self) -> Result<()>;

    fn initialize_account(&self, account: &AccountName) -> Result<()>;

    fn set_block_parameters(&self, cpu: ElasticLimitParameters, net: ElasticLimitParameters) -> Result<()>;

    /// Decay usage of `accounts` up to `time_slot` without consuming.
    fn update_account_usage(&self, accounts: &BTreeSet<AccountName>, time_slot: u32) -> Result<()>;

    /// Charge a finished transaction to `accounts` and to the block.
    fn add_transaction_usage(
        &self,
        accounts: &BTreeSet<AccountName>,
        cpu_usage: u64,
        net_usage: u64,
        time_slot: u32,
    ) -> Result<()>;

    fn add_pending_ram_usage(&self, account: &AccountName, ram_delta: i64) -> Result<()>;

    fn verify_account_ram_usage(&self, account: &AccountName) -> Result<()>;

    /// Stage new limits; they take effect at the next
    /// `process_account_limit_updates`. Returns whether RAM was lowered.
    fn set_account_limits(&self, account: &AccountName, limits: AccountResourceLimits) -> Result<bool>;

    fn get_account_limits(&self, account: &AccountName) -> Result<AccountResourceLimits>;

    fn get_account_ram_usage(&self, account: &AccountName) -> Result<i64>;

    fn process_account_limit_updates(&self) -> Result<()>;

    /// Fold the block's pending usage into the elastic limits.
    fn process_block_usage(&self, block_num: u32) -> Result<()>;

    /// CPU left in the pending block, in microseconds.
    fn get_block_cpu_limit(&self) -> Result<u64>;

    /// NET left in the pending block, in bytes.
    fn get_block_net_limit(&self) -> Result<u64>;

    /// `-1` when unlimited.
    fn get_account_cpu_limit(&self, account: &AccountName) -> Result<i64>;

    /// `-1` when unlimited.
    fn get_account_net_limit(&self, account: &AccountName) -> Result<i64>;

    fn get_virtual_block_cpu_limit(&self) -> Result<u64>;

    fn get_virtual_block_net_limit(&self) -> Result<u64>;
}

/// Permissions and signature checks.
pub trait AuthorizationManager: Send + Sync {
    fn create_permission(
        &self,
        account: &AccountName,
        name: &AccountName,
        parent: &AccountName,
        auth: Authority,
        now: TimePoint,
    ) -> Result<PermissionObject>;

    fn modify_permission(&self, permission: &PermissionObject, auth: Authority, now: TimePoint) -> Result<()>;

    fn remove_permission(&self, account: &AccountName, name: &AccountName) -> Result<()>;

    fn find_permission(&self, level: &PermissionLevel) -> Result<Option<PermissionObject>>;

    fn get_permission(&self, level: &PermissionLevel) -> Result<PermissionObject>;

    /// Fails unless every declared authorization of `actions` is satisfied
    /// by `provided_keys`, `provided_permissions` and `provided_delay_us`.
    fn check_authorization(
        &self,
        actions: &[Action],
        provided_keys: &BTreeSet<PublicKey>,
        provided_permissions: &BTreeSet<PermissionLevel>,
        provided_delay_us: i64,
        checktime: &dyn Fn() -> Result<()>,
        allow_unused_keys: bool,
    ) -> Result<()>;
}

/// Executes deployed contract code.
pub trait ContractEngine: Send + Sync {
    fn apply(&self, code_hash: &Digest, code: &[u8], context: &mut ApplyContext<'_, '_>) -> Result<()>;
}

/// Engine for chains without contracts: accounts with code are rejected.
#[derive(Debug, Default)]
pub struct NullEngine;

impl ContractEngine for NullEngine {
    fn apply(&self, code_hash: &Digest, _code: &[u8], _context: &mut ApplyContext<'_, '_>) -> Result<()> {
        Err(crate::error::ChainError::Engine(format!(
            "no contract engine configured for code {code_hash}"
        )))
    }
}
