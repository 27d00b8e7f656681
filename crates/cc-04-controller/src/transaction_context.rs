//! # Transaction Context
//!
//! Executes one transaction against the pending block: CPU and NET
//! budgeting, deadline checks, the nested undo session, action dispatch and
//! final billing.
//!
//! ## Lifecycle
//!
//! ```text
//!   new ──► init_for_{input,implicit,deferred}_trx ──► exec ──► finalize ──► into_parts
//!              │ limits, deadline, session              │ actions      │ billing
//!              └─────────────── any error: session dropped, writes undone ───────┘
//! ```
//!
//! ## Budgets
//!
//! | Budget | Source | Error when exceeded |
//! |--------|--------|---------------------|
//! | objective CPU | `max_transaction_cpu_usage`, trx `max_cpu_usage_ms`, payer limits | `TxCpuUsageExceeded` |
//! | block CPU | CPU left in the pending block | `BlockCpuUsageExceeded` |
//! | NET | `max_transaction_net_usage`, trx `max_net_usage_words`, payer and block limits | `TxNetUsageExceeded` / `BlockNetUsageExceeded` |
//! | wall clock | caller deadline | `Deadline` |
//! | leeway | subjective leeway while producing | `LeewayDeadline` |

use crate::apply_context::ApplyContext;
use crate::config::{ChainConfig, ControllerConfig};
use crate::domain::chain_objects::{
    BlockSummaryObject, GeneratedTransactionObject, GlobalPropertyObject, TransactionObject,
};
use crate::domain::protocol_features::{BuiltinProtocolFeature, ProtocolFeatureManager};
use crate::domain::AccountObject;
use crate::error::{ChainError, Result};
use crate::ports::{AuthorizationManager, ContractEngine, ResourceLimitsManager};
use cc_01_state_store::{singleton_key, Database, Session, StateError};
use cc_03_fork_database::PendingBlockHeaderState;
use shared_types::{
    AccountName, Action, ActionTrace, BlockId, BlockTimestamp, ChainId, Digest, PackedTransaction,
    PublicKey, TimePoint, TransactionId, TransactionTrace,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Extra NET billed for the generated-transaction row of a delayed input
/// transaction.
const TRANSACTION_ID_NET_USAGE: u64 = 32;

/// Facts about the pending block a transaction runs in.
#[derive(Clone, Copy, Debug)]
pub struct PendingBlockInfo {
    pub block_num: u32,
    pub timestamp: BlockTimestamp,
    /// Block status is `Incomplete`.
    pub producing: bool,
    pub skip_auth_check: bool,
    /// Skip expiration, TaPoS and referenced-account checks.
    pub skip_trx_checks: bool,
    pub skip_db_sessions: bool,
    pub replay_head_time: Option<TimePoint>,
    pub producer_block_id: Option<BlockId>,
}

/// Read-only view of the controller a transaction executes against.
#[derive(Clone, Copy)]
pub struct ChainContext<'a> {
    pub db: &'a Database,
    pub config: &'a ControllerConfig,
    pub resource_limits: &'a dyn ResourceLimitsManager,
    pub authorization: &'a dyn AuthorizationManager,
    pub engine: &'a dyn ContractEngine,
    pub protocol_features: &'a ProtocolFeatureManager,
    pub pending_header: &'a PendingBlockHeaderState,
    pub chain_id: ChainId,
    pub pending: PendingBlockInfo,
}

impl ChainContext<'_> {
    pub fn is_builtin_activated(&self, feature: BuiltinProtocolFeature) -> bool {
        self.protocol_features
            .is_builtin_activated(feature, self.pending.block_num)
    }

    pub fn pending_block_time(&self) -> TimePoint {
        self.pending.timestamp.to_time_point()
    }
}

/// Which limit the current deadline stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DeadlineKind {
    Deadline,
    BlockCpu,
    TxCpu,
    Leeway,
}

impl DeadlineKind {
    fn error(self) -> ChainError {
        match self {
            DeadlineKind::Deadline => ChainError::Deadline,
            DeadlineKind::BlockCpu => ChainError::BlockCpuUsageExceeded,
            DeadlineKind::TxCpu => ChainError::TxCpuUsageExceeded,
            DeadlineKind::Leeway => ChainError::LeewayDeadline,
        }
    }
}

pub struct TransactionContext<'c> {
    pub chain: ChainContext<'c>,
    pub packed_trx: Arc<PackedTransaction>,
    pub id: TransactionId,
    pub chain_config: ChainConfig,
    undo_session: Option<Session>,
    pub trace: TransactionTrace,
    pub start: TimePoint,
    pub published: TimePoint,

    pub executed_action_receipt_digests: Vec<Digest>,
    pub bill_to_accounts: BTreeSet<AccountName>,
    pub validate_ram_usage: BTreeSet<AccountName>,

    /// Wall-clock deadline from the caller.
    pub deadline: TimePoint,
    pub leeway_us: i64,
    pub billed_cpu_time_us: i64,
    pub explicit_billed_cpu_time: bool,
    pub explicit_net_usage: bool,
    pub is_input: bool,
    pub apply_context_free: bool,
    pub enforce_whiteblacklist: bool,
    /// Microseconds.
    pub delay: i64,

    net_limit: u64,
    net_limit_due_to_block: bool,
    eager_net_limit: u64,
    objective_duration_limit: i64,
    billing_timer_kind: DeadlineKind,
    effective_deadline: TimePoint,
    deadline_kind: DeadlineKind,
    is_initialized: bool,
}

impl<'c> TransactionContext<'c> {
    pub fn new(
        chain: ChainContext<'c>,
        packed_trx: Arc<PackedTransaction>,
        id: TransactionId,
        start: TimePoint,
    ) -> Result<Self> {
        let gpo: GlobalPropertyObject = chain.db.get(&singleton_key())?;
        let trace = TransactionTrace {
            id,
            block_num: chain.pending.block_num,
            block_time: chain.pending.timestamp,
            producer_block_id: chain.pending.producer_block_id,
            ..Default::default()
        };
        Ok(Self {
            chain,
            packed_trx,
            id,
            chain_config: gpo.configuration,
            undo_session: None,
            trace,
            start,
            published: TimePoint::default(),
            executed_action_receipt_digests: Vec::new(),
            bill_to_accounts: BTreeSet::new(),
            validate_ram_usage: BTreeSet::new(),
            deadline: TimePoint::MAX,
            leeway_us: 0,
            billed_cpu_time_us: 0,
            explicit_billed_cpu_time: false,
            explicit_net_usage: false,
            is_input: false,
            apply_context_free: true,
            enforce_whiteblacklist: true,
            delay: 0,
            net_limit: 0,
            net_limit_due_to_block: true,
            eager_net_limit: 0,
            objective_duration_limit: 0,
            billing_timer_kind: DeadlineKind::BlockCpu,
            effective_deadline: TimePoint::MAX,
            deadline_kind: DeadlineKind::Deadline,
            is_initialized: false,
        })
    }

    fn trx(&self) -> &shared_types::Transaction {
        &self.packed_trx.transaction
    }

    fn init(&mut self, initial_net_usage: u64) -> Result<()> {
        if self.is_initialized {
            return Err(ChainError::Transaction("cannot initialize twice".into()));
        }
        let rl = self.chain.resource_limits;
        let cfg = self.chain_config.clone();

        // block and objective limits
        self.net_limit = rl.get_block_net_limit()?;
        self.objective_duration_limit = cfg.max_transaction_cpu_usage as i64;
        self.billing_timer_kind = DeadlineKind::TxCpu;
        let block_cpu_left = rl.get_block_cpu_limit()? as i64;
        if block_cpu_left < self.objective_duration_limit {
            self.objective_duration_limit = block_cpu_left;
            self.billing_timer_kind = DeadlineKind::BlockCpu;
        }
        if cfg.max_transaction_net_usage as u64 <= self.net_limit {
            self.net_limit = cfg.max_transaction_net_usage as u64;
            self.net_limit_due_to_block = false;
        }

        // transaction-specified limits
        let header = self.trx().header.clone();
        if header.max_net_usage_words > 0 {
            let trx_limit = header.max_net_usage_words as u64 * 8;
            if trx_limit < self.net_limit {
                self.net_limit = trx_limit;
                self.net_limit_due_to_block = false;
            }
        }
        if header.max_cpu_usage_ms > 0 {
            let trx_limit = header.max_cpu_usage_ms as i64 * 1000;
            if trx_limit < self.objective_duration_limit {
                self.objective_duration_limit = trx_limit;
                self.billing_timer_kind = DeadlineKind::TxCpu;
            }
        }
        if self.delay > cfg.max_transaction_delay as i64 * 1_000_000 {
            return Err(ChainError::DelayTooLong);
        }

        // accounts to bill
        let only_first = self.chain.is_builtin_activated(BuiltinProtocolFeature::OnlyBillFirstAuthorizer);
        if only_first {
            if let Some(first) = self.trx().first_authorizer() {
                self.bill_to_accounts.insert(first);
            }
        } else {
            let actors: Vec<AccountName> = self
                .trx()
                .actions
                .iter()
                .flat_map(|a| a.authorization.iter().map(|p| p.actor.clone()))
                .collect();
            self.bill_to_accounts.extend(actors);
        }
        let slot = self.chain.pending.timestamp.slot;
        rl.update_account_usage(&self.bill_to_accounts, slot)?;

        // payer limits
        for account in &self.bill_to_accounts {
            let net = rl.get_account_net_limit(account)?;
            if net >= 0 && (net as u64) < self.net_limit {
                self.net_limit = net as u64;
                self.net_limit_due_to_block = false;
            }
            let cpu = rl.get_account_cpu_limit(account)?;
            if cpu >= 0 && cpu < self.objective_duration_limit {
                self.objective_duration_limit = cpu;
                self.billing_timer_kind = DeadlineKind::TxCpu;
            }
        }

        self.eager_net_limit = self.net_limit;

        if self.explicit_billed_cpu_time {
            if self.billed_cpu_time_us < cfg.min_transaction_cpu_usage as i64 {
                return Err(ChainError::Transaction(format!(
                    "cannot bill CPU time less than the minimum of {} us",
                    cfg.min_transaction_cpu_usage
                )));
            }
            if self.billed_cpu_time_us > self.objective_duration_limit {
                return Err(self.billing_timer_kind.error());
            }
            self.effective_deadline = self.deadline;
            self.deadline_kind = DeadlineKind::Deadline;
        } else {
            let leeway = if self.chain.pending.producing { self.leeway_us } else { 0 };
            let mut objective = self.objective_duration_limit;
            let mut kind = self.billing_timer_kind;
            if leeway > 0 && objective < leeway {
                objective = leeway;
                kind = DeadlineKind::Leeway;
            }
            let objective_deadline = self.start.add_micros(objective);
            if self.deadline < objective_deadline {
                self.effective_deadline = self.deadline;
                self.deadline_kind = DeadlineKind::Deadline;
            } else {
                self.effective_deadline = objective_deadline;
                self.deadline_kind = kind;
            }
        }

        if !self.explicit_net_usage {
            self.trace.net_usage = initial_net_usage;
        }
        self.check_net_usage()?;
        self.checktime()?;

        if !self.chain.pending.skip_db_sessions {
            self.undo_session = Some(self.chain.db.make_session());
        }
        self.is_initialized = true;
        trace!(
            trx = %self.id,
            net_limit = self.net_limit,
            cpu_limit_us = self.objective_duration_limit,
            "[cc-04] transaction context initialized"
        );
        Ok(())
    }

    /// Prepare a signed user transaction. `skip_recording` leaves the id out
    /// of the dedup table (old replayed transactions).
    pub fn init_for_input_trx(
        &mut self,
        packed_trx_unprunable_size: u64,
        packed_trx_prunable_size: u64,
        skip_recording: bool,
    ) -> Result<()> {
        let cfg = self.chain_config.clone();
        let trx = self.trx().clone();
        if !trx.transaction_extensions.is_empty() {
            return Err(if self.chain.pending.producing {
                ChainError::TransactionExtensions
            } else {
                ChainError::ObjectiveBlockValidation("transaction includes disallowed extensions".into())
            });
        }
        if trx.actions.is_empty() {
            return Err(ChainError::ActionValidate("transaction must have at least one action".into()));
        }
        if trx.actions.iter().any(|a| a.authorization.is_empty()) {
            return Err(ChainError::TxNoAuths);
        }

        let discounted_size_for_pruned_data = packed_trx_prunable_size
            * cfg.context_free_discount_net_usage_num as u64
            / cfg.context_free_discount_net_usage_den.max(1) as u64;
        let mut initial_net_usage = cfg.base_per_transaction_net_usage as u64
            + packed_trx_unprunable_size
            + discounted_size_for_pruned_data;
        if trx.header.delay_sec > 0 {
            initial_net_usage += cfg.base_per_transaction_net_usage as u64 + TRANSACTION_ID_NET_USAGE;
        }

        self.published = self.chain.pending_block_time();
        self.is_input = true;
        if !self.chain.pending.skip_trx_checks {
            self.validate_expiration()?;
            self.validate_tapos()?;
            self.validate_referenced_accounts()?;
        }
        self.init(initial_net_usage)?;
        if !skip_recording {
            self.record_transaction()?;
        }
        Ok(())
    }

    pub fn init_for_implicit_trx(&mut self, initial_net_usage: u64) -> Result<()> {
        if !self.trx().transaction_extensions.is_empty() {
            return Err(ChainError::TransactionExtensions);
        }
        self.published = self.chain.pending_block_time();
        self.init(initial_net_usage)
    }

    pub fn init_for_deferred_trx(&mut self, published: TimePoint) -> Result<()> {
        if !self.trx().transaction_extensions.is_empty() {
            return Err(ChainError::TransactionExtensions);
        }
        self.trace.scheduled = true;
        self.apply_context_free = false;
        self.published = published;
        self.init(0)
    }

    fn validate_expiration(&self) -> Result<()> {
        let expiration = self.trx().header.expiration.to_time_point();
        let now = self.chain.pending_block_time();
        if now > expiration {
            return Err(ChainError::ExpiredTransaction);
        }
        let lifetime = self.chain_config.max_transaction_lifetime as i64 * 1_000_000;
        if expiration > now.add_micros(lifetime) {
            return Err(ChainError::ExpirationTooFar);
        }
        Ok(())
    }

    fn validate_tapos(&self) -> Result<()> {
        let slot = self.trx().header.ref_block_num;
        let summary: Option<BlockSummaryObject> = self.chain.db.find(&BlockSummaryObject::key(slot))?;
        match summary {
            Some(s) if self.trx().verify_reference_block(&s.block_id) => Ok(()),
            _ => Err(ChainError::InvalidRefBlock),
        }
    }

    fn validate_referenced_accounts(&self) -> Result<()> {
        let db = self.chain.db;
        let exists = |name: &AccountName| -> Result<bool> {
            Ok(db.find::<AccountObject>(&AccountObject::key(name))?.is_some())
        };
        for act in &self.trx().context_free_actions {
            if !exists(&act.account)? {
                return Err(ChainError::UnknownAccount(act.account.clone()));
            }
            if !act.authorization.is_empty() {
                return Err(ChainError::ActionValidate(
                    "context-free actions cannot have authorizations".into(),
                ));
            }
        }
        for act in &self.trx().actions {
            if !exists(&act.account)? {
                return Err(ChainError::UnknownAccount(act.account.clone()));
            }
            for auth in &act.authorization {
                if !exists(&auth.actor)? {
                    return Err(ChainError::UnknownAccount(auth.actor.clone()));
                }
            }
        }
        Ok(())
    }

    fn record_transaction(&mut self) -> Result<()> {
        let row = TransactionObject {
            trx_id: self.id,
            expiration: self.trx().header.expiration,
        };
        match self.chain.db.create(&row) {
            Ok(()) => Ok(()),
            Err(StateError::AlreadyExists { .. }) => Err(ChainError::DuplicateTransaction { id: self.id }),
            Err(e) => Err(e.into()),
        }
    }

    /// Run every action of the transaction, or schedule it when delayed.
    pub fn exec(&mut self) -> Result<()> {
        if !self.is_initialized {
            return Err(ChainError::Transaction("must first initialize".into()));
        }
        let trx = self.trx().clone();
        if self.apply_context_free {
            for act in &trx.context_free_actions {
                self.schedule_action(act.clone(), act.account.clone(), true, 0);
            }
        }
        if self.delay == 0 {
            for act in &trx.actions {
                self.schedule_action(act.clone(), act.account.clone(), false, 0);
            }
        }
        let num_original_actions = self.trace.action_traces.len() as u32;
        for ordinal in 1..=num_original_actions {
            self.execute_action(ordinal, 0)?;
        }
        if self.delay != 0 {
            self.schedule_transaction()?;
        }
        Ok(())
    }

    /// Verify RAM, round NET, settle CPU and charge the payers.
    pub fn finalize(&mut self) -> Result<()> {
        if !self.is_initialized {
            return Err(ChainError::Transaction("must first initialize".into()));
        }
        let rl = self.chain.resource_limits;
        if self.is_input {
            let packed = Arc::clone(&self.packed_trx);
            for act in &packed.transaction.actions {
                for auth in &act.authorization {
                    self.validate_ram_usage.insert(auth.actor.clone());
                }
            }
        }
        for account in &self.validate_ram_usage {
            rl.verify_account_ram_usage(account)?;
        }

        if !self.explicit_net_usage {
            self.trace.net_usage = self.trace.net_usage.div_ceil(8) * 8;
        }
        self.eager_net_limit = self.net_limit;
        self.check_net_usage()?;

        let now = TimePoint::now();
        self.trace.elapsed_us = now.elapsed_since(self.start);
        if !self.explicit_billed_cpu_time {
            let min = self.chain_config.min_transaction_cpu_usage as i64;
            self.billed_cpu_time_us = self.trace.elapsed_us.max(min);
            if self.billed_cpu_time_us > self.objective_duration_limit {
                return Err(self.billing_timer_kind.error());
            }
        }

        rl.add_transaction_usage(
            &self.bill_to_accounts,
            self.billed_cpu_time_us as u64,
            self.trace.net_usage,
            self.chain.pending.timestamp.slot,
        )?;
        Ok(())
    }

    pub fn checktime(&self) -> Result<()> {
        if TimePoint::now() > self.effective_deadline {
            return Err(self.deadline_kind.error());
        }
        Ok(())
    }

    fn check_net_usage(&self) -> Result<()> {
        if self.explicit_net_usage {
            return Ok(());
        }
        if self.trace.net_usage > self.eager_net_limit {
            return Err(if self.net_limit_due_to_block {
                ChainError::BlockNetUsageExceeded
            } else {
                ChainError::TxNetUsageExceeded {
                    used: self.trace.net_usage,
                    limit: self.eager_net_limit,
                }
            });
        }
        Ok(())
    }

    pub fn add_net_usage(&mut self, usage: u64) -> Result<()> {
        if self.explicit_net_usage {
            return Ok(());
        }
        self.trace.net_usage += usage;
        self.check_net_usage()
    }

    /// Treat `net_usage` as final; used when a validated block already
    /// committed to it. Call before `init_for_input_trx`.
    pub fn set_explicit_net_usage(&mut self, net_usage: u64) {
        self.trace.net_usage = net_usage;
        self.explicit_net_usage = true;
    }

    pub fn add_ram_usage(&mut self, account: &AccountName, ram_delta: i64) -> Result<()> {
        self.chain.resource_limits.add_pending_ram_usage(account, ram_delta)?;
        if ram_delta > 0 {
            self.validate_ram_usage.insert(account.clone());
        }
        Ok(())
    }

    /// Append an action trace and return its ordinal (1-based).
    pub fn schedule_action(
        &mut self,
        act: Action,
        receiver: AccountName,
        context_free: bool,
        creator_action_ordinal: u32,
    ) -> u32 {
        let action_ordinal = self.trace.action_traces.len() as u32 + 1;
        self.trace.action_traces.push(ActionTrace {
            action_ordinal,
            creator_action_ordinal,
            receiver,
            act,
            context_free,
            ..Default::default()
        });
        action_ordinal
    }

    pub fn execute_action(&mut self, action_ordinal: u32, recurse_depth: u32) -> Result<()> {
        let mut context = ApplyContext::new(self, action_ordinal, recurse_depth)?;
        context.exec()
    }

    pub fn action_trace_mut(&mut self, action_ordinal: u32) -> Result<&mut ActionTrace> {
        self.trace
            .action_traces
            .get_mut(action_ordinal.saturating_sub(1) as usize)
            .ok_or_else(|| ChainError::Fatal(format!("action ordinal {action_ordinal} out of range")))
    }

    /// Store a delayed input transaction as a generated transaction.
    fn schedule_transaction(&mut self) -> Result<()> {
        let trx = self.trx().clone();
        let payer = trx
            .first_authorizer()
            .ok_or(ChainError::TxNoAuths)?;
        let delay_until = self.published.add_micros(self.delay);
        let gto = GeneratedTransactionObject {
            trx_id: self.id,
            sender: AccountName::default(),
            sender_id: 0,
            payer: payer.clone(),
            delay_until,
            expiration: delay_until
                .add_micros(self.chain_config.deferred_trx_expiration_window as i64 * 1_000_000),
            published: self.published,
            packed_trx: bincode::serialize(&trx).map_err(|e| ChainError::Transaction(e.to_string()))?,
        };
        let size = gto.billable_size();
        self.chain.db.create(&gto)?;
        self.add_ram_usage(&payer, size)
    }

    pub fn squash(&mut self) -> Result<()> {
        if let Some(session) = self.undo_session.take() {
            session.squash()?;
        }
        Ok(())
    }

    pub fn undo(&mut self) -> Result<()> {
        if let Some(session) = self.undo_session.take() {
            session.undo()?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.is_initialized
    }

    // --- black / white lists, enforced while producing ---

    fn enforcing_lists(&self) -> bool {
        self.enforce_whiteblacklist && self.chain.pending.producing
    }

    pub fn check_actor_list(&self, actors: &BTreeSet<AccountName>) -> Result<()> {
        if !self.enforcing_lists() {
            return Ok(());
        }
        let cfg = self.chain.config;
        if !cfg.actor_whitelist.is_empty() {
            if let Some(a) = actors.iter().find(|a| !cfg.actor_whitelist.contains(*a)) {
                return Err(ChainError::ActorWhitelist(a.clone()));
            }
        }
        if let Some(a) = actors.iter().find(|a| cfg.actor_blacklist.contains(*a)) {
            return Err(ChainError::ActorBlacklisted(a.clone()));
        }
        Ok(())
    }

    pub fn check_contract_list(&self, code: &AccountName) -> Result<()> {
        if !self.enforcing_lists() {
            return Ok(());
        }
        let cfg = self.chain.config;
        if !cfg.contract_whitelist.is_empty() && !cfg.contract_whitelist.contains(code) {
            return Err(ChainError::ContractWhitelist(code.clone()));
        }
        if cfg.contract_blacklist.contains(code) {
            return Err(ChainError::ContractBlacklisted(code.clone()));
        }
        Ok(())
    }

    pub fn check_action_list(&self, code: &AccountName, action: &AccountName) -> Result<()> {
        if !self.enforcing_lists() {
            return Ok(());
        }
        if self.chain.config.action_blacklist.contains(&(code.clone(), action.clone())) {
            return Err(ChainError::ActionBlacklisted(code.clone(), action.clone()));
        }
        Ok(())
    }

    pub fn check_key_list(&self, keys: &BTreeSet<PublicKey>) -> Result<()> {
        if !self.enforcing_lists() {
            return Ok(());
        }
        if let Some(k) = keys.iter().find(|k| self.chain.config.key_blacklist.contains(*k)) {
            return Err(ChainError::KeyBlacklisted(*k));
        }
        Ok(())
    }

    /// Hand back the trace, the still-open session and the action receipt
    /// digests; the context's borrows end here.
    pub fn into_parts(self) -> (TransactionTrace, Option<Session>, Vec<Digest>) {
        (self.trace, self.undo_session, self.executed_action_receipt_digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ChainFixture;
    use shared_types::{PermissionLevel, Transaction, TransactionHeader};

    fn transfer(fx: &ChainFixture, max_net_usage_words: u32) -> Arc<PackedTransaction> {
        let mut trx = Transaction {
            header: TransactionHeader {
                expiration: fx.pending_time().add_micros(30_000_000).into(),
                max_net_usage_words,
                ..Default::default()
            },
            actions: vec![Action::new("alice", "noop", vec![PermissionLevel::new("alice", "active")], vec![])],
            ..Default::default()
        };
        trx.set_reference_block(&fx.head_id());
        Arc::new(PackedTransaction::new(trx))
    }

    #[test]
    fn test_input_trx_recorded_once() {
        let fx = ChainFixture::new();
        let packed = transfer(&fx, 0);
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.squash().unwrap();

            let mut again = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            assert!(matches!(
                again.init_for_input_trx(packed.unprunable_size() as u64, 0, false),
                Err(ChainError::DuplicateTransaction { .. })
            ));
        });
    }

    #[test]
    fn test_trx_net_limit_enforced() {
        let fx = ChainFixture::new();
        let packed = transfer(&fx, 1);
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            assert!(matches!(
                ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false),
                Err(ChainError::TxNetUsageExceeded { limit: 8, .. })
            ));
        });
    }

    #[test]
    fn test_finalize_checks_ram_of_input_authorizers() {
        let fx = ChainFixture::new();
        let packed = transfer(&fx, 0);
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.finalize().unwrap();
            assert!(ctx.validate_ram_usage.contains(&AccountName::new("alice")));
            assert_eq!(ctx.trace.net_usage % 8, 0);
        });
    }

    #[test]
    fn test_explicit_net_usage_replaces_measured_net() {
        let fx = ChainFixture::new();
        let packed = transfer(&fx, 1);
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.set_explicit_net_usage(5 * 8);
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            assert_eq!(ctx.trace.net_usage, 40);
            ctx.add_net_usage(1_000).unwrap();
            assert_eq!(ctx.trace.net_usage, 40);
        });
    }

    #[test]
    fn test_bad_tapos_and_expiration_rejected() {
        let fx = ChainFixture::new();
        let mut trx = transfer(&fx, 0).transaction.clone();
        trx.header.ref_block_prefix ^= 1;
        let packed = Arc::new(PackedTransaction::new(trx.clone()));
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            assert!(matches!(ctx.init_for_input_trx(0, 0, false), Err(ChainError::InvalidRefBlock)));
        });

        trx.set_reference_block(&fx.head_id());
        trx.header.expiration = fx.pending_time().sub_micros(1_000_000).into();
        let packed = Arc::new(PackedTransaction::new(trx));
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            assert!(matches!(ctx.init_for_input_trx(0, 0, false), Err(ChainError::ExpiredTransaction)));
        });
    }

    #[test]
    fn test_expired_caller_deadline_fails_checktime() {
        let fx = ChainFixture::new();
        let packed = transfer(&fx, 0);
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.deadline = TimePoint(1);
            assert!(matches!(
                ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false),
                Err(ChainError::Deadline)
            ));
        });
    }

    #[test]
    fn test_blacklisted_actor_rejected_only_while_producing() {
        let mut fx = ChainFixture::new();
        fx.config.actor_blacklist.insert(AccountName::new("alice"));
        let packed = transfer(&fx, 0);
        let actors = BTreeSet::from([AccountName::new("alice")]);
        fx.with_context(|chain| {
            let ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            assert!(matches!(ctx.check_actor_list(&actors), Err(ChainError::ActorBlacklisted(_))));
        });
        fx.producing = false;
        fx.with_context(|chain| {
            let ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.check_actor_list(&actors).unwrap();
        });
    }
}
