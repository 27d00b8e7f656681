//! Executing input, implicit and scheduled transactions in the pending
//! block.

use super::Controller;
use crate::config::DbReadMode;
use crate::domain::chain_objects::{GeneratedTransactionObject, GlobalPropertyObject};
use crate::domain::pending_block::BlockStatus;
use crate::domain::system_actions::{OnError, SystemAction};
use crate::error::{ChainError, Result};
use crate::events::emit;
use crate::transaction_context::TransactionContext;
use cc_01_state_store::{singleton_key, Session};
use shared_types::{
    AccountName, Digest, PackedTransaction, PermissionLevel, ReceiptTrx, TimePoint, Transaction,
    TransactionId, TransactionMetadata, TransactionReceipt, TransactionReceiptHeader,
    TransactionStatus, TransactionTrace, TrxType,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// How a transaction enters execution.
enum TrxInit {
    Input {
        skip_recording: bool,
        /// NET words a validated block's receipt committed to.
        explicit_net_usage_words: Option<u32>,
    },
    Implicit,
    Deferred { published: TimePoint },
    /// The onerror notification for a failed deferred transaction, delivered
    /// to its sender.
    OnError { published: TimePoint, receiver: AccountName },
}

struct ExecutionLimits {
    start: TimePoint,
    deadline: TimePoint,
    leeway_us: i64,
    billed_cpu_time_us: u32,
    explicit_billed_cpu_time: bool,
    enforce_whiteblacklist: bool,
}

/// What is left of a transaction context once its borrows end.
struct Executed {
    result: Result<()>,
    trace: TransactionTrace,
    session: Option<Session>,
    action_digests: Vec<Digest>,
    billed_cpu_time_us: i64,
    bill_to_accounts: BTreeSet<AccountName>,
    delay_us: i64,
}

impl Executed {
    fn keep(self) -> Result<()> {
        match self.session {
            Some(s) => Ok(s.squash()?),
            None => Ok(()),
        }
    }
}

/// Receipt and digest counts to roll the building block back to.
#[derive(Clone, Copy)]
struct RestorePoint {
    receipts: usize,
    actions: usize,
    metas: usize,
}

fn run_transaction(ctx: &mut TransactionContext<'_>, trx: &TransactionMetadata, init: TrxInit) -> Result<()> {
    let trn = trx.trx();
    match init {
        TrxInit::Input {
            skip_recording,
            explicit_net_usage_words,
        } => {
            let packed = trx.packed_trx();
            if let Some(words) = explicit_net_usage_words {
                ctx.set_explicit_net_usage(words as u64 * 8);
            }
            ctx.init_for_input_trx(packed.unprunable_size() as u64, packed.prunable_size() as u64, skip_recording)?;
            ctx.delay = trn.header.delay_sec as i64 * 1_000_000;
            ctx.check_actor_list(&actors_of(trn))?;
            if !ctx.chain.pending.skip_auth_check {
                let authorization = ctx.chain.authorization;
                let checking: &TransactionContext<'_> = ctx;
                authorization.check_authorization(
                    &trn.actions,
                    trx.recovered_keys(),
                    &BTreeSet::new(),
                    checking.delay,
                    &|| checking.checktime(),
                    false,
                )?;
            }
            ctx.check_key_list(trx.recovered_keys())?;
        }
        TrxInit::Implicit => {
            ctx.init_for_implicit_trx(0)?;
            ctx.enforce_whiteblacklist = false;
        }
        TrxInit::Deferred { published } => {
            ctx.init_for_deferred_trx(published)?;
            ctx.check_actor_list(&actors_of(trn))?;
        }
        TrxInit::OnError { published, receiver } => {
            ctx.init_for_implicit_trx(0)?;
            ctx.published = published;
            let act = trn
                .actions
                .first()
                .cloned()
                .ok_or_else(|| ChainError::Transaction("onerror transaction has no action".into()))?;
            let ordinal = ctx.schedule_action(act, receiver, false, 0);
            ctx.execute_action(ordinal, 0)?;
            return ctx.finalize();
        }
    }
    ctx.exec()?;
    ctx.finalize()
}

fn actors_of(trx: &Transaction) -> BTreeSet<AccountName> {
    trx.actions
        .iter()
        .flat_map(|a| a.authorization.iter().map(|p| p.actor.clone()))
        .collect()
}

impl Controller {
    /// Apply `trx` to the building block.
    ///
    /// Objective failures come back as a trace carrying the error; only
    /// resource exhaustion and objective block validation failures are
    /// returned as `Err`.
    pub fn push_transaction(
        &mut self,
        trx: Arc<TransactionMetadata>,
        deadline: TimePoint,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> Result<Arc<TransactionTrace>> {
        self.push_transaction_with_net(trx, deadline, billed_cpu_time_us, explicit_billed_cpu_time, None)
    }

    /// `push_transaction` billing exactly `explicit_net_usage_words` of NET
    /// when set.
    pub(super) fn push_transaction_with_net(
        &mut self,
        trx: Arc<TransactionMetadata>,
        deadline: TimePoint,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
        explicit_net_usage_words: Option<u32>,
    ) -> Result<Arc<TransactionTrace>> {
        let status = {
            let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
            pending.building()?;
            pending.block_status
        };
        if deadline == TimePoint(0) {
            return Err(ChainError::MissingDeadline);
        }

        let mut start = TimePoint::now();
        if !explicit_billed_cpu_time {
            let already_consumed = trx.signature_cpu_usage_us() * self.config.sig_cpu_bill_pct as i64 / 100;
            start = if start.micros() < already_consumed {
                TimePoint(0)
            } else {
                start.sub_micros(already_consumed)
            };
        }
        let limits = ExecutionLimits {
            start,
            deadline,
            leeway_us: match self.config.subjective_cpu_leeway_us {
                Some(leeway) if status == BlockStatus::Incomplete => leeway,
                _ => 0,
            },
            billed_cpu_time_us,
            explicit_billed_cpu_time,
            enforce_whiteblacklist: true,
        };
        let init = if trx.is_implicit() {
            TrxInit::Implicit
        } else {
            let expiration = trx.trx().header.expiration.to_time_point();
            TrxInit::Input {
                skip_recording: self.replay_head_time.is_some_and(|t| expiration <= t),
                explicit_net_usage_words,
            }
        };

        let mut executed = self.execute_transaction(&trx, *trx.id(), init, &limits)?;
        let failure = match std::mem::replace(&mut executed.result, Ok(())) {
            Ok(()) => None,
            Err(e) if e.must_propagate() => return Err(e),
            Err(e) => Some(e),
        };

        if let Some(e) = failure {
            debug!(trx = %trx.id(), error = %e, "[cc-04] transaction failed");
            let mut trace = executed.trace;
            trace.elapsed_us = TimePoint::now().elapsed_since(start);
            trace.except = Some(e.details());
            if let Some(session) = executed.session {
                session.undo()?;
            }
            let trace = Arc::new(trace);
            self.emit_transaction(&trx, &trace, trx.packed_trx())?;
            return Ok(trace);
        }

        let header = TransactionReceiptHeader {
            status: if executed.delay_us == 0 {
                TransactionStatus::Executed
            } else {
                TransactionStatus::Delayed
            },
            cpu_usage_us: executed.billed_cpu_time_us as u32,
            net_usage_words: (executed.trace.net_usage / 8) as u32,
        };
        let restore = self.restore_point()?;
        let building = self.building_mut()?;
        if !trx.is_implicit() {
            building.push_receipt(TransactionReceipt {
                header: header.clone(),
                trx: ReceiptTrx::Packed((**trx.packed_trx()).clone()),
            });
            building.pending_trx_metas.push(trx.clone());
        }
        building
            .action_receipt_digests
            .extend(std::mem::take(&mut executed.action_digests));
        executed.trace.receipt = Some(header);
        let trace = Arc::new(std::mem::take(&mut executed.trace));

        if let Err(e) = self.emit_transaction(&trx, &trace, trx.packed_trx()) {
            self.restore(restore)?;
            return Err(e);
        }

        if self.config.read_mode != DbReadMode::Speculative && status == BlockStatus::Incomplete {
            // not producing: nothing of this transaction stays in the block
            self.restore(restore)?;
            if let Some(session) = executed.session {
                session.undo()?;
            }
        } else {
            executed.keep()?;
        }
        Ok(trace)
    }

    /// Run the generated transaction `id` if it is due.
    ///
    /// A due transaction always produces a receipt unless it failed
    /// subjectively; in that case it stays scheduled.
    pub fn push_scheduled_transaction(
        &mut self,
        id: &TransactionId,
        deadline: TimePoint,
        billed_cpu_time_us: u32,
        explicit_billed_cpu_time: bool,
    ) -> Result<Arc<TransactionTrace>> {
        let (pending_time, slot) = {
            let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
            let building = pending.building()?;
            let ts = building.pending_block_header_state.timestamp;
            (ts.to_time_point(), ts.slot)
        };
        if deadline == TimePoint(0) {
            return Err(ChainError::MissingDeadline);
        }
        let gto: GeneratedTransactionObject = self
            .db
            .find(id.as_bytes())?
            .ok_or(ChainError::UnknownTransaction { id: *id })?;

        let undo_session = if self.skip_db_sessions() {
            None
        } else {
            Some(self.db.make_session())
        };
        let ram_delta = -gto.billable_size();
        self.db.remove::<GeneratedTransactionObject>(gto.trx_id.as_bytes())?;
        self.resource_limits.add_pending_ram_usage(&gto.payer, ram_delta)?;

        if gto.delay_until > pending_time {
            return Err(ChainError::TransactionNotReady);
        }

        let decoded: Transaction =
            bincode::deserialize(&gto.packed_trx).map_err(|e| ChainError::Transaction(e.to_string()))?;
        let packed = Arc::new(PackedTransaction::new(decoded));
        let meta = TransactionMetadata::create_no_recover_keys(packed.clone(), TrxType::Scheduled);

        if gto.expiration < pending_time {
            let (block_num, block_time, producer_block_id) = self.pending_trace_fields()?;
            let header = TransactionReceiptHeader {
                status: TransactionStatus::Expired,
                cpu_usage_us: billed_cpu_time_us,
                net_usage_words: 0,
            };
            self.building_mut()?.push_receipt(TransactionReceipt {
                header: header.clone(),
                trx: ReceiptTrx::Id(gto.trx_id),
            });
            let trace = Arc::new(TransactionTrace {
                id: gto.trx_id,
                block_num,
                block_time,
                producer_block_id,
                scheduled: true,
                receipt: Some(header),
                account_ram_delta: Some((gto.payer.clone(), ram_delta)),
                ..Default::default()
            });
            self.emit_transaction(&meta, &trace, &packed)?;
            if let Some(s) = undo_session {
                s.squash()?;
            }
            debug!(trx = %gto.trx_id, "[cc-04] scheduled transaction expired");
            return Ok(trace);
        }

        let limits = ExecutionLimits {
            start: TimePoint::now(),
            deadline,
            leeway_us: 0,
            billed_cpu_time_us,
            explicit_billed_cpu_time,
            enforce_whiteblacklist: gto.sender.is_empty()
                || !self.config.sender_bypass_whiteblacklist.contains(&gto.sender),
        };
        let mut executed = self.execute_transaction(
            &meta,
            gto.trx_id,
            TrxInit::Deferred {
                published: gto.published,
            },
            &limits,
        )?;

        let error = match std::mem::replace(&mut executed.result, Ok(())) {
            Ok(()) => {
                let header = TransactionReceiptHeader {
                    status: TransactionStatus::Executed,
                    cpu_usage_us: executed.billed_cpu_time_us as u32,
                    net_usage_words: (executed.trace.net_usage / 8) as u32,
                };
                let building = self.building_mut()?;
                building.push_receipt(TransactionReceipt {
                    header: header.clone(),
                    trx: ReceiptTrx::Id(gto.trx_id),
                });
                building
                    .action_receipt_digests
                    .extend(std::mem::take(&mut executed.action_digests));
                executed.trace.receipt = Some(header);
                executed.trace.account_ram_delta = Some((gto.payer.clone(), ram_delta));
                let trace = Arc::new(std::mem::take(&mut executed.trace));
                self.emit_transaction(&meta, &trace, &packed)?;
                executed.keep()?;
                if let Some(s) = undo_session {
                    s.squash()?;
                }
                return Ok(trace);
            }
            Err(e) if e.must_propagate() => return Err(e),
            Err(e) => e,
        };

        if let Some(s) = executed.session.take() {
            s.undo()?;
        }
        let cpu_time_to_bill_us = if explicit_billed_cpu_time {
            billed_cpu_time_us as i64
        } else {
            let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
            TimePoint::now()
                .elapsed_since(limits.start)
                .max(gpo.configuration.min_transaction_cpu_usage as i64)
        };
        let subjective = |e: &ChainError| {
            if explicit_billed_cpu_time {
                e.is_subjective()
            } else {
                e.is_scheduled_subjective()
            }
        };

        let mut failure = error;
        let mut trace = executed.trace;
        trace.except = Some(failure.details());
        trace.elapsed_us = TimePoint::now().elapsed_since(limits.start);

        if !gto.sender.is_empty() && !subjective(&failure) {
            let mut onerror = self.apply_onerror(&gto, &limits)?;
            match std::mem::replace(&mut onerror.result, Ok(())) {
                Ok(()) => {
                    let header = TransactionReceiptHeader {
                        status: TransactionStatus::SoftFail,
                        cpu_usage_us: onerror.billed_cpu_time_us as u32,
                        net_usage_words: (onerror.trace.net_usage / 8) as u32,
                    };
                    let building = self.building_mut()?;
                    building.push_receipt(TransactionReceipt {
                        header: header.clone(),
                        trx: ReceiptTrx::Id(gto.trx_id),
                    });
                    building
                        .action_receipt_digests
                        .extend(std::mem::take(&mut onerror.action_digests));
                    let mut error_trace = std::mem::take(&mut onerror.trace);
                    error_trace.receipt = Some(header);
                    error_trace.failed_dtrx_trace = Some(Box::new(trace));
                    let error_trace = Arc::new(error_trace);
                    self.emit_transaction(&meta, &error_trace, &packed)?;
                    onerror.keep()?;
                    if let Some(s) = undo_session {
                        s.squash()?;
                    }
                    debug!(trx = %gto.trx_id, "[cc-04] scheduled transaction soft failed");
                    return Ok(error_trace);
                }
                Err(e) if e.must_propagate() => return Err(e),
                Err(e) => {
                    if let Some(s) = onerror.session.take() {
                        s.undo()?;
                    }
                    let mut error_trace = onerror.trace;
                    error_trace.except = Some(e.details());
                    error_trace.failed_dtrx_trace = Some(Box::new(trace));
                    trace = error_trace;
                    failure = e;
                }
            }
        }

        if subjective(&failure) {
            // left scheduled: dropping the session restores the row
            let trace = Arc::new(trace);
            self.emit_transaction(&meta, &trace, &packed)?;
            debug!(trx = %gto.trx_id, error = %failure, "[cc-04] scheduled transaction failed subjectively");
            drop(undo_session);
            return Ok(trace);
        }

        let mut cpu_to_bill = cpu_time_to_bill_us;
        if !explicit_billed_cpu_time {
            let gpo: GlobalPropertyObject = self.db.get(&singleton_key())?;
            self.resource_limits
                .update_account_usage(&executed.bill_to_accounts, slot)?;
            let mut account_cpu_limit = i64::MAX;
            for account in &executed.bill_to_accounts {
                let limit = self.resource_limits.get_account_cpu_limit(account)?;
                if limit >= 0 {
                    account_cpu_limit = account_cpu_limit.min(limit);
                }
            }
            cpu_to_bill = cpu_to_bill
                .min(account_cpu_limit)
                .min(gpo.configuration.max_transaction_cpu_usage as i64);
        }
        self.resource_limits
            .add_transaction_usage(&executed.bill_to_accounts, cpu_to_bill as u64, 0, slot)?;
        let header = TransactionReceiptHeader {
            status: TransactionStatus::HardFail,
            cpu_usage_us: cpu_to_bill as u32,
            net_usage_words: 0,
        };
        self.building_mut()?.push_receipt(TransactionReceipt {
            header: header.clone(),
            trx: ReceiptTrx::Id(gto.trx_id),
        });
        trace.receipt = Some(header);
        trace.account_ram_delta = Some((gto.payer.clone(), ram_delta));
        let trace = Arc::new(trace);
        self.emit_transaction(&meta, &trace, &packed)?;
        if let Some(s) = undo_session {
            s.squash()?;
        }
        warn!(trx = %gto.trx_id, error = %failure, "[cc-04] scheduled transaction hard failed");
        Ok(trace)
    }

    /// Deliver `onerror` for the failed deferred transaction to its sender.
    fn apply_onerror(&mut self, gto: &GeneratedTransactionObject, limits: &ExecutionLimits) -> Result<Executed> {
        let pending_time = self.pending_block_time()?;
        let action = OnError {
            sender_id: gto.sender_id,
            sent_trx_id: gto.trx_id,
            sent_trx: gto.packed_trx.clone(),
        }
        .to_action(vec![PermissionLevel::new(gto.sender.as_str(), "active")]);
        let mut etrx = Transaction {
            actions: vec![action],
            ..Default::default()
        };
        etrx.header.expiration = pending_time.add_micros(999_999).into();
        etrx.set_reference_block(&self.head.id());
        let meta = TransactionMetadata::create_no_recover_keys(Arc::new(PackedTransaction::new(etrx)), TrxType::Implicit);

        let was_requiring_checks = self.in_trx_requiring_checks;
        self.in_trx_requiring_checks = true;
        let executed = self.execute_transaction(
            &meta,
            *meta.id(),
            TrxInit::OnError {
                published: gto.published,
                receiver: gto.sender.clone(),
            },
            limits,
        );
        self.in_trx_requiring_checks = was_requiring_checks;
        executed
    }

    fn execute_transaction(
        &self,
        trx: &TransactionMetadata,
        id: TransactionId,
        init: TrxInit,
        limits: &ExecutionLimits,
    ) -> Result<Executed> {
        let chain = self.chain_context()?;
        let mut ctx = TransactionContext::new(chain, trx.packed_trx().clone(), id, limits.start)?;
        ctx.deadline = limits.deadline;
        ctx.leeway_us = limits.leeway_us;
        ctx.explicit_billed_cpu_time = limits.explicit_billed_cpu_time;
        ctx.billed_cpu_time_us = limits.billed_cpu_time_us as i64;
        ctx.enforce_whiteblacklist = limits.enforce_whiteblacklist;

        let result = run_transaction(&mut ctx, trx, init);
        let billed_cpu_time_us = ctx.billed_cpu_time_us;
        let bill_to_accounts = std::mem::take(&mut ctx.bill_to_accounts);
        let delay_us = ctx.delay;
        let (trace, session, action_digests) = ctx.into_parts();
        Ok(Executed {
            result,
            trace,
            session,
            action_digests,
            billed_cpu_time_us,
            bill_to_accounts,
            delay_us,
        })
    }

    fn emit_transaction(
        &self,
        meta: &Arc<TransactionMetadata>,
        trace: &Arc<TransactionTrace>,
        packed: &Arc<PackedTransaction>,
    ) -> Result<()> {
        if meta.mark_accepted() {
            emit(&self.signals.accepted_transaction, meta)?;
        }
        emit(&self.signals.applied_transaction, &(trace.clone(), packed.clone()))
    }

    fn building_mut(&mut self) -> Result<&mut crate::domain::pending_block::BuildingBlock> {
        self.pending
            .as_mut()
            .ok_or(ChainError::NoPendingBlock)?
            .building_mut()
    }

    fn pending_trace_fields(&self) -> Result<(u32, shared_types::BlockTimestamp, Option<shared_types::BlockId>)> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        Ok((pending.block_num(), pending.timestamp(), pending.producer_block_id))
    }

    fn restore_point(&self) -> Result<RestorePoint> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let building = pending.building()?;
        Ok(RestorePoint {
            receipts: building.pending_trx_receipts.len(),
            actions: building.action_receipt_digests.len(),
            metas: building.pending_trx_metas.len(),
        })
    }

    fn restore(&mut self, point: RestorePoint) -> Result<()> {
        let building = self.building_mut()?;
        building.truncate(point.receipts, point.actions);
        building.pending_trx_metas.truncate(point.metas);
        Ok(())
    }
}
