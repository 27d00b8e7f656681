//! # Apply Context
//!
//! Runs one action for its receiver and every account the receiver
//! notifies, then the inline actions they queued. This is the host API a
//! `ContractEngine` sees.
//!
//! ## Dispatch
//!
//! ```text
//!   exec
//!    ├─ exec_one(receiver)          native handler (system::system::*) and/or engine
//!    ├─ exec_one(notified[1..])     same action, other receivers
//!    ├─ context-free inline actions  depth + 1
//!    └─ inline actions               depth + 1
//! ```
//!
//! Every successful `exec_one` produces an action receipt whose digest goes
//! into the block's action merkle.

use crate::domain::authority::code_permission_name;
use crate::domain::chain_objects::{
    AccountObject, CodeObject, ContractRowObject, DynamicGlobalPropertyObject,
    GeneratedTransactionObject, GlobalPropertyObject, ProtocolStateObject,
};
use crate::domain::protocol_features::{BuiltinProtocolFeature, Recognized};
use crate::error::{ChainError, Result};
use crate::native_actions;
use crate::transaction_context::{ChainContext, TransactionContext};
use cc_01_state_store::{singleton_key, StateError};
use shared_types::{
    system_account, AccountName, Action, ActionReceipt, Digest, PermissionLevel, ProducerKey,
    ProducerSchedule, TimePoint, Transaction,
};
use std::collections::BTreeSet;
use tracing::debug;

pub struct ApplyContext<'t, 'c> {
    trx_context: &'t mut TransactionContext<'c>,
    action_ordinal: u32,
    recurse_depth: u32,
    receiver: AccountName,
    act: Action,
    context_free: bool,
    privileged: bool,
    /// Receivers of this action, in notification order, with their trace ordinals.
    notified: Vec<(AccountName, u32)>,
    inline_actions: Vec<u32>,
    cfa_inline_actions: Vec<u32>,
    console: String,
}

impl<'t, 'c> ApplyContext<'t, 'c> {
    pub fn new(trx_context: &'t mut TransactionContext<'c>, action_ordinal: u32, recurse_depth: u32) -> Result<Self> {
        let trace = trx_context.action_trace_mut(action_ordinal)?;
        let receiver = trace.receiver.clone();
        let act = trace.act.clone();
        let context_free = trace.context_free;
        Ok(Self {
            trx_context,
            action_ordinal,
            recurse_depth,
            receiver,
            act,
            context_free,
            privileged: false,
            notified: Vec::new(),
            inline_actions: Vec::new(),
            cfa_inline_actions: Vec::new(),
            console: String::new(),
        })
    }

    pub(crate) fn chain(&self) -> ChainContext<'c> {
        self.trx_context.chain
    }

    pub fn receiver(&self) -> &AccountName {
        &self.receiver
    }

    pub fn act(&self) -> &Action {
        &self.act
    }

    pub fn is_context_free(&self) -> bool {
        self.context_free
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn action_ordinal(&self) -> u32 {
        self.action_ordinal
    }

    pub fn pending_block_time(&self) -> TimePoint {
        self.chain().pending_block_time()
    }

    pub(crate) fn trx_context(&mut self) -> &mut TransactionContext<'c> {
        self.trx_context
    }

    pub fn exec(&mut self) -> Result<()> {
        self.notified.push((self.receiver.clone(), self.action_ordinal));
        self.exec_one()?;
        let mut i = 1;
        while i < self.notified.len() {
            let (receiver, ordinal) = self.notified[i].clone();
            self.receiver = receiver;
            self.action_ordinal = ordinal;
            self.exec_one()?;
            i += 1;
        }

        if !self.cfa_inline_actions.is_empty() || !self.inline_actions.is_empty() {
            let max_depth = self.trx_context.chain_config.max_inline_action_depth as u32;
            if self.recurse_depth >= max_depth {
                return Err(ChainError::InlineActionDepth);
            }
        }
        let depth = self.recurse_depth + 1;
        for ordinal in std::mem::take(&mut self.cfa_inline_actions) {
            self.trx_context.execute_action(ordinal, depth)?;
        }
        for ordinal in std::mem::take(&mut self.inline_actions) {
            self.trx_context.execute_action(ordinal, depth)?;
        }
        Ok(())
    }

    fn exec_one(&mut self) -> Result<()> {
        let start = TimePoint::now();
        let result = self.run_handlers().and_then(|()| self.finalize_receipt());
        let elapsed = TimePoint::now().elapsed_since(start);
        let console = std::mem::take(&mut self.console);
        let trace = self.trx_context.action_trace_mut(self.action_ordinal)?;
        trace.elapsed_us = elapsed;
        trace.console = console;
        match result {
            Ok(receipt) => {
                trace.receipt = Some(receipt);
                Ok(())
            }
            Err(e) => {
                trace.except = Some(e.details());
                Err(e)
            }
        }
    }

    fn run_handlers(&mut self) -> Result<()> {
        let chain = self.chain();
        let account: AccountObject = chain
            .db
            .find(&AccountObject::key(&self.receiver))?
            .ok_or_else(|| ChainError::UnknownAccount(self.receiver.clone()))?;
        self.privileged = account.privileged;

        self.trx_context.check_contract_list(&self.receiver)?;
        self.trx_context.check_action_list(&self.act.account, &self.act.name)?;

        if self.receiver == system_account() && self.act.account == system_account() {
            native_actions::apply(self)?;
        }

        if !account.code_hash.is_zero() {
            let code: CodeObject = chain.db.get(account.code_hash.as_bytes())?;
            chain.engine.apply(&account.code_hash, &code.code, self)?;
        }
        Ok(())
    }

    fn finalize_receipt(&mut self) -> Result<ActionReceipt> {
        let db = self.chain().db;
        let dgpo = db.modify::<DynamicGlobalPropertyObject, _>(&singleton_key(), |p| {
            p.global_action_sequence += 1;
        })?;
        let receiver_account = db.modify::<AccountObject, _>(&AccountObject::key(&self.receiver), |a| {
            a.recv_sequence += 1;
        })?;
        let code_account: AccountObject = db
            .find(&AccountObject::key(&self.act.account))?
            .ok_or_else(|| ChainError::UnknownAccount(self.act.account.clone()))?;
        for auth in &self.act.authorization {
            db.modify::<AccountObject, _>(&AccountObject::key(&auth.actor), |a| {
                a.auth_sequence += 1;
            })?;
        }

        let receipt = ActionReceipt {
            receiver: self.receiver.clone(),
            act_digest: self.act.digest(),
            global_sequence: dgpo.global_action_sequence,
            recv_sequence: receiver_account.recv_sequence,
            code_sequence: code_account.code_sequence,
        };
        self.trx_context.executed_action_receipt_digests.push(receipt.digest());
        Ok(receipt)
    }

    // --- authorization ---

    pub fn has_authorization(&self, account: &AccountName) -> bool {
        self.act.authorization.iter().any(|p| &p.actor == account)
    }

    pub fn require_authorization(&self, account: &AccountName) -> Result<()> {
        if self.has_authorization(account) {
            Ok(())
        } else {
            Err(ChainError::MissingAuth {
                account: account.clone(),
            })
        }
    }

    pub fn require_authorization_level(&self, account: &AccountName, permission: &AccountName) -> Result<()> {
        let found = self
            .act
            .authorization
            .iter()
            .any(|p| &p.actor == account && &p.permission == permission);
        if found {
            Ok(())
        } else {
            Err(ChainError::MissingAuth {
                account: account.clone(),
            })
        }
    }

    pub fn is_account(&self, account: &AccountName) -> Result<bool> {
        Ok(self
            .chain()
            .db
            .find::<AccountObject>(&AccountObject::key(account))?
            .is_some())
    }

    fn has_recipient(&self, account: &AccountName) -> bool {
        self.notified.iter().any(|(a, _)| a == account)
    }

    /// Deliver this action to `recipient` after the current receiver.
    pub fn require_recipient(&mut self, recipient: &AccountName) -> Result<()> {
        if self.has_recipient(recipient) {
            return Ok(());
        }
        let creator = self.trx_context.action_trace_mut(self.action_ordinal)?.creator_action_ordinal;
        let ordinal = self
            .trx_context
            .schedule_action(self.act.clone(), recipient.clone(), self.context_free, creator);
        self.notified.push((recipient.clone(), ordinal));
        Ok(())
    }

    // --- inline actions ---

    fn check_inline_size(&self, a: &Action) -> Result<()> {
        let size = bincode::serialized_size(a).map_err(|e| ChainError::ActionValidate(e.to_string()))?;
        let chain = self.chain();
        let max_nonprivileged = chain.config.max_nonprivileged_inline_action_size as u64;
        if !self.privileged && chain.pending.producing && size > max_nonprivileged {
            return Err(ChainError::InlineActionTooBig {
                size,
                limit: max_nonprivileged,
            });
        }
        let max = self.trx_context.chain_config.max_inline_action_size as u64;
        if size > max {
            return Err(ChainError::ActionValidate(format!(
                "inline action too big for nonprivileged account {}: {size} > {max}",
                self.receiver
            )));
        }
        Ok(())
    }

    /// Authorizations other than the receiver's own must be satisfiable by
    /// `receiver@code`.
    fn check_sent_authorization(&self, actions: &[Action], delay_us: i64) -> Result<()> {
        let chain = self.chain();
        if self.privileged || chain.pending.skip_auth_check {
            return Ok(());
        }
        let foreign: Vec<Action> = actions
            .iter()
            .filter(|a| a.authorization.iter().any(|p| p.actor != self.receiver))
            .map(|a| Action {
                authorization: a
                    .authorization
                    .iter()
                    .filter(|p| p.actor != self.receiver)
                    .cloned()
                    .collect(),
                ..a.clone()
            })
            .collect();
        if foreign.is_empty() {
            return Ok(());
        }
        let provided = BTreeSet::from([PermissionLevel {
            actor: self.receiver.clone(),
            permission: code_permission_name(),
        }]);
        let trx = &*self.trx_context;
        chain.authorization.check_authorization(
            &foreign,
            &BTreeSet::new(),
            &provided,
            delay_us,
            &|| trx.checktime(),
            false,
        )
    }

    fn validate_sent_action(&self, a: &Action) -> Result<()> {
        if !self.is_account(&a.account)? {
            return Err(ChainError::UnknownAccount(a.account.clone()));
        }
        for auth in &a.authorization {
            if self.chain().authorization.find_permission(auth)?.is_none() {
                return Err(ChainError::ActionValidate(format!(
                    "inline action's authorizations include a non-existent permission: {}@{}",
                    auth.actor, auth.permission
                )));
            }
        }
        Ok(())
    }

    pub fn send_inline(&mut self, a: Action) -> Result<()> {
        if self.context_free {
            return Err(ChainError::Unauthorized(
                "context-free actions cannot send inline actions".into(),
            ));
        }
        self.validate_sent_action(&a)?;
        self.check_inline_size(&a)?;
        let delay = self.trx_context.delay;
        self.check_sent_authorization(std::slice::from_ref(&a), delay)?;
        let receiver = a.account.clone();
        let ordinal = self
            .trx_context
            .schedule_action(a, receiver, false, self.action_ordinal);
        self.inline_actions.push(ordinal);
        Ok(())
    }

    pub fn send_context_free_inline(&mut self, a: Action) -> Result<()> {
        if !a.authorization.is_empty() {
            return Err(ChainError::ActionValidate(
                "context-free actions cannot have authorizations".into(),
            ));
        }
        if !self.is_account(&a.account)? {
            return Err(ChainError::UnknownAccount(a.account.clone()));
        }
        self.check_inline_size(&a)?;
        let receiver = a.account.clone();
        let ordinal = self
            .trx_context
            .schedule_action(a, receiver, true, self.action_ordinal);
        self.cfa_inline_actions.push(ordinal);
        Ok(())
    }

    // --- deferred transactions ---

    fn find_generated(&self, sender: &AccountName, sender_id: u128) -> Result<Option<GeneratedTransactionObject>> {
        let all: Vec<GeneratedTransactionObject> = self.chain().db.all()?;
        Ok(all
            .into_iter()
            .find(|g| &g.sender == sender && g.sender_id == sender_id))
    }

    /// Store `trx` to run after its `delay_sec`, billed to `payer`.
    pub fn schedule_deferred(
        &mut self,
        sender_id: u128,
        payer: &AccountName,
        mut trx: Transaction,
        replace_existing: bool,
    ) -> Result<()> {
        if self.context_free {
            return Err(ChainError::Unauthorized(
                "context-free actions cannot schedule deferred transactions".into(),
            ));
        }
        if !trx.context_free_actions.is_empty() {
            return Err(ChainError::ActionValidate(
                "context free actions are not currently allowed in generated transactions".into(),
            ));
        }
        if !trx.transaction_extensions.is_empty() {
            return Err(ChainError::ActionValidate(
                "transaction extensions are not allowed in generated transactions".into(),
            ));
        }
        if payer.is_empty() {
            return Err(ChainError::ActionValidate("must specify a valid account to pay for new record".into()));
        }
        let chain = self.chain();
        let now = chain.pending_block_time();
        trx.header.expiration = now.add_micros(999_999).into();
        trx.header.ref_block_num = 0;
        trx.header.ref_block_prefix = 0;

        let delay = trx.header.delay_sec as i64 * 1_000_000;
        let cfg = self.trx_context.chain_config.clone();
        if trx.header.delay_sec > cfg.max_transaction_delay {
            return Err(ChainError::DelayTooLong);
        }

        if !self.privileged {
            if payer != &self.receiver {
                self.require_authorization(payer)?;
            }
            for a in &trx.actions {
                self.validate_sent_action(a)?;
            }
            self.check_sent_authorization(&trx.actions, delay)?;
        }

        let trx_id = if chain.is_builtin_activated(BuiltinProtocolFeature::NoDuplicateDeferredId) {
            Digest::hash_of(&(&self.receiver, sender_id, trx.id(), self.trx_context.id))
        } else {
            trx.id()
        };

        if let Some(existing) = self.find_generated(&self.receiver, sender_id)? {
            if !replace_existing {
                return Err(ChainError::DeferredTxDuplicate);
            }
            if !chain.is_builtin_activated(BuiltinProtocolFeature::ReplaceDeferred) && chain.pending.producing {
                return Err(ChainError::ActionValidate(
                    "replacing a deferred transaction is temporarily disabled".into(),
                ));
            }
            self.trx_context
                .add_ram_usage(&existing.payer, -existing.billable_size())?;
            chain.db.remove::<GeneratedTransactionObject>(existing.trx_id.as_bytes())?;
        }

        let delay_until = now.add_micros(delay);
        let gto = GeneratedTransactionObject {
            trx_id,
            sender: self.receiver.clone(),
            sender_id,
            payer: payer.clone(),
            delay_until,
            expiration: delay_until.add_micros(cfg.deferred_trx_expiration_window as i64 * 1_000_000),
            published: now,
            packed_trx: bincode::serialize(&trx).map_err(|e| ChainError::ActionValidate(e.to_string()))?,
        };
        let size = gto.billable_size();
        chain.db.create(&gto).map_err(|e| match e {
            StateError::AlreadyExists { .. } => ChainError::DeferredTxDuplicate,
            other => other.into(),
        })?;
        self.trx_context.add_ram_usage(payer, size)?;
        debug!(sender = %self.receiver, sender_id, trx = %trx_id, "[cc-04] deferred transaction scheduled");
        Ok(())
    }

    /// Returns whether a deferred transaction was found and removed.
    pub fn cancel_deferred(&mut self, sender_id: u128) -> Result<bool> {
        let Some(gto) = self.find_generated(&self.receiver, sender_id)? else {
            return Ok(false);
        };
        self.trx_context.add_ram_usage(&gto.payer, -gto.billable_size())?;
        self.chain()
            .db
            .remove::<GeneratedTransactionObject>(gto.trx_id.as_bytes())?;
        Ok(true)
    }

    // --- contract tables ---

    fn update_db_usage(&mut self, payer: &AccountName, delta: i64) -> Result<()> {
        if delta > 0 && !(self.privileged || payer == &self.receiver) {
            self.require_authorization(payer)?;
        }
        self.trx_context.add_ram_usage(payer, delta)
    }

    fn row_key(&self, table: &AccountName, primary_key: u64) -> Vec<u8> {
        ContractRowObject::key(&self.receiver, table, primary_key)
    }

    pub fn db_store(&mut self, table: &AccountName, payer: &AccountName, primary_key: u64, value: Vec<u8>) -> Result<()> {
        if payer.is_empty() {
            return Err(ChainError::ActionValidate("must specify a valid account to pay for new record".into()));
        }
        let row = ContractRowObject {
            code: self.receiver.clone(),
            table: table.clone(),
            primary_key,
            payer: payer.clone(),
            value,
        };
        self.chain().db.create(&row).map_err(|e| match e {
            StateError::AlreadyExists { .. } => {
                ChainError::ActionValidate(format!("row {primary_key} already exists in {table}"))
            }
            other => other.into(),
        })?;
        self.update_db_usage(payer, row.billable_size())
    }

    pub fn db_find(&self, code: &AccountName, table: &AccountName, primary_key: u64) -> Result<Option<Vec<u8>>> {
        let row: Option<ContractRowObject> = self
            .chain()
            .db
            .find(&ContractRowObject::key(code, table, primary_key))?;
        Ok(row.map(|r| r.value))
    }

    /// `payer` of `None` keeps the current payer.
    pub fn db_update(
        &mut self,
        table: &AccountName,
        primary_key: u64,
        payer: Option<&AccountName>,
        value: Vec<u8>,
    ) -> Result<()> {
        let key = self.row_key(table, primary_key);
        let db = self.chain().db;
        let old: ContractRowObject = db
            .find(&key)?
            .ok_or_else(|| ChainError::ActionValidate(format!("row {primary_key} not found in {table}")))?;
        let new_payer = payer.cloned().unwrap_or_else(|| old.payer.clone());
        let old_size = old.billable_size();
        let updated = db.modify::<ContractRowObject, _>(&key, |r| {
            r.value = value;
            r.payer = new_payer.clone();
        })?;
        let new_size = updated.billable_size();
        if new_payer != old.payer {
            self.update_db_usage(&old.payer, -old_size)?;
            self.update_db_usage(&new_payer, new_size)?;
        } else if new_size != old_size {
            self.update_db_usage(&old.payer, new_size - old_size)?;
        }
        Ok(())
    }

    pub fn db_remove(&mut self, table: &AccountName, primary_key: u64) -> Result<()> {
        let key = self.row_key(table, primary_key);
        let row: ContractRowObject = self
            .chain()
            .db
            .remove(&key)
            .map_err(|_| ChainError::ActionValidate(format!("row {primary_key} not found in {table}")))?;
        self.update_db_usage(&row.payer, -row.billable_size())
    }

    // --- console, time ---

    pub fn print(&mut self, message: &str) {
        self.console.push_str(message);
    }

    pub fn checktime(&self) -> Result<()> {
        self.trx_context.checktime()
    }

    // --- privileged intrinsics ---

    fn require_privileged(&self, what: &str) -> Result<()> {
        if self.privileged {
            Ok(())
        } else {
            Err(ChainError::Unauthorized(format!("{what} requires a privileged account")))
        }
    }

    /// Returns the proposed schedule version, or `-1` when nothing changed.
    pub fn set_proposed_producers(&mut self, producers: Vec<ProducerKey>) -> Result<i64> {
        self.require_privileged("set_proposed_producers")?;
        propose_producer_schedule(&self.chain(), producers)
    }

    fn require_intrinsic(&self, name: &str) -> Result<()> {
        let ps: ProtocolStateObject = self.chain().db.get(&singleton_key())?;
        if ps.whitelisted_intrinsics.contains(name) {
            Ok(())
        } else {
            Err(ChainError::Unauthorized(format!("intrinsic {name} is not available")))
        }
    }

    pub fn preactivate_feature(&mut self, feature_digest: &Digest) -> Result<()> {
        self.require_privileged("preactivate_feature")?;
        self.require_intrinsic("preactivate_feature")?;
        preactivate_protocol_feature(&self.chain(), feature_digest)
    }

    pub fn is_feature_activated(&self, feature_digest: &Digest) -> Result<bool> {
        self.require_intrinsic("is_feature_activated")?;
        Ok(self.chain().protocol_features.is_active(feature_digest))
    }
}

/// Record `producers` as the proposed schedule of the pending block.
///
/// Returns the version the schedule will take, or `-1` when it matches the
/// schedule it would replace or a proposal from an earlier block is still
/// outstanding.
pub(crate) fn propose_producer_schedule(chain: &ChainContext<'_>, producers: Vec<ProducerKey>) -> Result<i64> {
    let mut names = BTreeSet::new();
    for p in &producers {
        if chain.db.find::<AccountObject>(&AccountObject::key(&p.producer_name))?.is_none() {
            return Err(ChainError::ProducerSchedule(format!(
                "producer schedule includes a nonexisting account {}",
                p.producer_name
            )));
        }
        if !names.insert(p.producer_name.clone()) {
            return Err(ChainError::ProducerSchedule("duplicate producer name in producer schedule".into()));
        }
    }
    if producers.is_empty() && chain.is_builtin_activated(BuiltinProtocolFeature::DisallowEmptyProducerSchedule) {
        return Err(ChainError::ProducerSchedule("producer schedule cannot be empty".into()));
    }

    let gpo: GlobalPropertyObject = chain.db.get(&singleton_key())?;
    let cur_block_num = chain.pending.block_num;
    if let Some(num) = gpo.proposed_schedule_block_num {
        if num != cur_block_num {
            return Ok(-1);
        }
        if gpo.proposed_schedule.producers == producers {
            return Ok(-1);
        }
    }

    let pending = &chain.pending_header.prev_pending_schedule.schedule;
    let begin = if pending.producers.is_empty() {
        &chain.pending_header.common.active_schedule
    } else {
        pending
    };
    if begin.producers == producers {
        return Ok(-1);
    }
    let version = begin.version + 1;
    chain.db.modify::<GlobalPropertyObject, _>(&singleton_key(), |g| {
        g.proposed_schedule_block_num = Some(cur_block_num);
        g.proposed_schedule = ProducerSchedule { version, producers };
    })?;
    debug!(version, block_num = cur_block_num, "[cc-04] producer schedule proposed");
    Ok(version as i64)
}

/// Mark a recognized feature for activation by a later block.
pub(crate) fn preactivate_protocol_feature(chain: &ChainContext<'_>, digest: &Digest) -> Result<()> {
    let set = chain.protocol_features.set();
    match set.is_recognized(digest, chain.pending.timestamp) {
        Recognized::Ready => {}
        Recognized::Unrecognized => {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{digest}' is unrecognized"
            )))
        }
        Recognized::Disabled => {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{digest}' is disabled"
            )))
        }
        Recognized::TooEarly => {
            return Err(ChainError::ProtocolFeature(format!(
                "protocol feature with digest '{digest}' is not yet activatable"
            )))
        }
    }
    if chain.protocol_features.is_active(digest) {
        return Err(ChainError::ProtocolFeature(format!(
            "protocol feature with digest '{digest}' is already activated"
        )));
    }
    let ps: ProtocolStateObject = chain.db.get(&singleton_key())?;
    if ps.preactivated_protocol_features.contains(digest) {
        return Err(ChainError::ProtocolFeature(format!(
            "protocol feature with digest '{digest}' is already pre-activated"
        )));
    }
    let deps_ok = set.validate_dependencies(digest, |dep| {
        chain.protocol_features.is_active(dep) || ps.preactivated_protocol_features.contains(dep)
    });
    if !deps_ok {
        return Err(ChainError::ProtocolFeature(format!(
            "not all dependencies of protocol feature with digest '{digest}' have been activated or pre-activated"
        )));
    }
    chain.db.modify::<ProtocolStateObject, _>(&singleton_key(), |p| {
        p.preactivated_protocol_features.push(*digest);
    })?;
    debug!(feature = %digest, "[cc-04] protocol feature pre-activated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ChainFixture;
    use shared_types::PackedTransaction;
    use std::sync::Arc;

    fn single_action(fx: &ChainFixture, act: Action) -> Arc<PackedTransaction> {
        let mut trx = Transaction {
            actions: vec![act],
            ..Default::default()
        };
        trx.header.expiration = fx.pending_time().add_micros(30_000_000).into();
        trx.set_reference_block(&fx.head_id());
        Arc::new(PackedTransaction::new(trx))
    }

    #[test]
    fn test_receipts_sequence_and_notifications() {
        let fx = ChainFixture::new();
        fx.engine.on("token", "transfer", |ctx| {
            if ctx.receiver().as_str() == "token" {
                ctx.require_recipient(&AccountName::new("alice"))?;
                ctx.require_recipient(&AccountName::new("alice"))?;
            }
            ctx.print("hi");
            Ok(())
        });
        let packed = single_action(
            &fx,
            Action::new("token", "transfer", vec![PermissionLevel::new("alice", "active")], vec![]),
        );
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.exec().unwrap();
            let traces = &ctx.trace.action_traces;
            assert_eq!(traces.len(), 2);
            assert_eq!(traces[1].receiver.as_str(), "alice");
            let r0 = traces[0].receipt.clone().unwrap();
            let r1 = traces[1].receipt.clone().unwrap();
            assert_eq!(r1.global_sequence, r0.global_sequence + 1);
            assert_eq!(traces[0].console, "hi");
            assert_eq!(ctx.executed_action_receipt_digests.len(), 2);
        });
    }

    #[test]
    fn test_inline_depth_limit() {
        let fx = ChainFixture::new();
        fx.engine.on("token", "loop", |ctx| {
            let again = ctx.act().clone();
            ctx.send_inline(Action {
                authorization: vec![],
                ..again
            })
        });
        let packed = single_action(
            &fx,
            Action::new("token", "loop", vec![PermissionLevel::new("alice", "active")], vec![]),
        );
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            assert!(matches!(ctx.exec(), Err(ChainError::InlineActionDepth)));
            let depth = ctx.chain_config.max_inline_action_depth as usize;
            assert_eq!(ctx.trace.action_traces.len(), depth + 2);
        });
    }

    #[test]
    fn test_table_rows_bill_ram_to_payer() {
        let fx = ChainFixture::new();
        fx.engine.on("token", "store", |ctx| {
            ctx.db_store(&AccountName::new("balances"), &AccountName::new("token"), 7, vec![0u8; 10])?;
            ctx.db_update(&AccountName::new("balances"), 7, None, vec![0u8; 20])?;
            assert_eq!(
                ctx.db_find(&AccountName::new("token"), &AccountName::new("balances"), 7)?,
                Some(vec![0u8; 20])
            );
            Ok(())
        });
        let packed = single_action(
            &fx,
            Action::new("token", "store", vec![PermissionLevel::new("alice", "active")], vec![]),
        );
        let before = fx.ram_usage("token");
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.exec().unwrap();
            ctx.squash().unwrap();
        });
        assert_eq!(fx.ram_usage("token") - before, 112 + 20);
    }

    #[test]
    fn test_schedule_and_cancel_deferred() {
        let fx = ChainFixture::new();
        fx.engine.on("token", "defer", |ctx| {
            let inner = Transaction {
                actions: vec![Action::new("token", "noop", vec![PermissionLevel::new("token", "active")], vec![])],
                ..Default::default()
            };
            ctx.schedule_deferred(1, &AccountName::new("token"), inner.clone(), false)?;
            assert!(matches!(
                ctx.schedule_deferred(1, &AccountName::new("token"), inner, false),
                Err(ChainError::DeferredTxDuplicate)
            ));
            assert!(ctx.cancel_deferred(1)?);
            assert!(!ctx.cancel_deferred(1)?);
            Ok(())
        });
        let packed = single_action(
            &fx,
            Action::new("token", "defer", vec![PermissionLevel::new("alice", "active")], vec![]),
        );
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.exec().unwrap();
        });
    }

    #[test]
    fn test_privileged_intrinsics_rejected_for_plain_accounts() {
        let fx = ChainFixture::new();
        fx.engine.on("token", "propose", |ctx| {
            assert!(matches!(
                ctx.set_proposed_producers(vec![]),
                Err(ChainError::Unauthorized(_))
            ));
            assert!(ctx.preactivate_feature(&Digest::ZERO).is_err());
            Ok(())
        });
        let packed = single_action(
            &fx,
            Action::new("token", "propose", vec![PermissionLevel::new("alice", "active")], vec![]),
        );
        fx.with_context(|chain| {
            let mut ctx = TransactionContext::new(chain, packed.clone(), packed.id(), TimePoint::now()).unwrap();
            ctx.init_for_input_trx(packed.unprunable_size() as u64, 0, false).unwrap();
            ctx.exec().unwrap();
        });
    }
}
