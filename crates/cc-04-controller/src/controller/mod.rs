//! # Controller
//!
//! Owns the state store, block log, reversible block store and fork
//! database, and drives every block through them.
//!
//! ```text
//!            start_block                  push_block (network)
//!                 │                               │
//!                 ▼                               ▼
//!   push_transaction / push_scheduled ── create_block_state_future
//!                 │                               │
//!           finalize_block                 fork_db.add
//!                 │                               │
//!   sign_block ──►│◄──── apply_block ◄──── maybe_switch_forks
//!                 ▼
//!           commit_block ──► head ──► log_irreversible ──► block log
//! ```
//!
//! ## Submodules
//!
//! | Module | Operations |
//! |--------|------------|
//! | `block_production` | `start_block`, `finalize_block`, `sign_block`, `commit_block`, `abort_block` |
//! | `transactions` | `push_transaction`, `push_scheduled_transaction`, onerror handling |
//! | `fork_choice` | `push_block`, `maybe_switch_forks`, `apply_block`, `log_irreversible`, `pop_block` |
//! | `startup` | genesis, snapshots, replay |
//!
//! ## Threading
//!
//! All methods take `&mut self` and are meant to be called from one thread.
//! Pure work (key recovery, merkle roots, block state construction, block
//! serialization) goes to the `chain` thread pool.

mod block_production;
mod fork_choice;
mod startup;
mod transactions;

pub use fork_choice::{ForkedBranchCallback, TrxMetaCacheLookup};

use crate::adapters::{DbAuthorization, DbResourceLimits};
use crate::apply_context::{preactivate_protocol_feature, propose_producer_schedule};
use crate::config::{ControllerConfig, DbReadMode, ValidationMode};
use crate::domain::chain_objects::{
    AccountObject, GeneratedTransactionObject, GlobalPropertyObject, TransactionObject,
};
use crate::domain::pending_block::{BlockStage, BlockStatus, PendingState};
use crate::domain::protocol_features::{check_protocol_features, ProtocolFeatureManager, ProtocolFeatureSet};
use crate::error::{ChainError, Result};
use crate::events::ControllerSignals;
use crate::ports::{AuthorizationManager, ContractEngine, NullEngine, ResourceLimitsManager};
use crate::transaction_context::{ChainContext, PendingBlockInfo};
use cc_01_state_store::{singleton_key, Database, FileStatePersistence};
use cc_02_block_log::{BlockLog, ReversibleBlockStore};
use cc_03_fork_database::{BlockHeaderState, BlockState, BlockStatePtr, ForkDatabase};
use shared_types::{
    AccountName, BlockId, BlockTimestamp, ChainId, Digest, NamedThreadPool, ProducerKey,
    ProducerSchedule, SignedBlock, TimePoint, TransactionId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

/// Builds a `Controller`: opens its stores and thread pool.
pub struct ControllerBuilder {
    config: ControllerConfig,
    engine: Arc<dyn ContractEngine>,
    protocol_features: Option<ProtocolFeatureSet>,
}

impl ControllerBuilder {
    pub fn engine(mut self, engine: Arc<dyn ContractEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Recognized protocol features; defaults to the builtins.
    pub fn protocol_features(mut self, set: ProtocolFeatureSet) -> Self {
        self.protocol_features = Some(set);
        self
    }

    pub fn build(self) -> Result<Controller> {
        let config = self.config;
        config.validate()?;

        let (db, reversible_blocks, fork_db) = if config.in_memory_state {
            (
                Database::in_memory(),
                ReversibleBlockStore::in_memory(),
                ForkDatabase::in_memory(),
            )
        } else {
            std::fs::create_dir_all(&config.state_dir).map_err(|e| {
                ChainError::Startup(format!(
                    "cannot create state directory {}: {e}",
                    config.state_dir.display()
                ))
            })?;
            let persistence = Arc::new(FileStatePersistence::new(config.state_path()));
            (
                Database::open(persistence)?,
                ReversibleBlockStore::open(config.reversible_blocks_path())?,
                ForkDatabase::new(&config.state_dir),
            )
        };
        let block_log = BlockLog::open(&config.blocks_dir, config.block_log_compression)?;

        let set = match self.protocol_features {
            Some(set) => set,
            None => ProtocolFeatureSet::with_builtins(TimePoint(0))?,
        };
        let thread_pool = Arc::new(NamedThreadPool::new("chain", config.thread_pool_size)?);
        let resource_limits: Arc<dyn ResourceLimitsManager> =
            Arc::new(DbResourceLimits::new(db.clone(), Default::default()));
        let authorization: Arc<dyn AuthorizationManager> = Arc::new(DbAuthorization::new(
            db.clone(),
            crate::config::ChainConfig::default().max_authority_depth,
        ));

        let head = Arc::new(BlockState::from_header_state(
            BlockHeaderState::default(),
            Arc::new(SignedBlock::default()),
        ));

        info!(
            blocks_dir = %config.blocks_dir.display(),
            state_dir = %config.state_dir.display(),
            read_mode = ?config.read_mode,
            "[cc-04] controller created"
        );

        Ok(Controller {
            config,
            db,
            block_log,
            reversible_blocks,
            fork_db,
            head,
            pending: None,
            protocol_features: ProtocolFeatureManager::new(Arc::new(set)),
            resource_limits,
            authorization,
            engine: self.engine,
            thread_pool,
            chain_id: ChainId::ZERO,
            signals: ControllerSignals::default(),
            replaying: false,
            replay_head_time: None,
            trusted_producer_light_validation: false,
            in_trx_requiring_checks: false,
            started: false,
            closed: false,
        })
    }
}

/// The chain controller.
pub struct Controller {
    config: ControllerConfig,
    db: Database,
    block_log: BlockLog,
    reversible_blocks: ReversibleBlockStore,
    fork_db: ForkDatabase,
    head: BlockStatePtr,
    pending: Option<PendingState>,
    protocol_features: ProtocolFeatureManager,
    resource_limits: Arc<dyn ResourceLimitsManager>,
    authorization: Arc<dyn AuthorizationManager>,
    engine: Arc<dyn ContractEngine>,
    thread_pool: Arc<NamedThreadPool>,
    chain_id: ChainId,
    signals: ControllerSignals,

    replaying: bool,
    /// Head time when replay started; older transactions skip the dedup table.
    replay_head_time: Option<TimePoint>,
    trusted_producer_light_validation: bool,
    /// Set while running onblock and onerror, which always run full checks.
    in_trx_requiring_checks: bool,
    started: bool,
    closed: bool,
}

impl Controller {
    pub fn builder(config: ControllerConfig) -> ControllerBuilder {
        ControllerBuilder {
            config,
            engine: Arc::new(NullEngine),
            protocol_features: None,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Handle to the state store. Writes outside a pending block are not
    /// undone by the controller.
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn signals(&self) -> &ControllerSignals {
        &self.signals
    }

    pub fn resource_limits(&self) -> &dyn ResourceLimitsManager {
        &*self.resource_limits
    }

    pub fn authorization(&self) -> &dyn AuthorizationManager {
        &*self.authorization
    }

    pub fn protocol_features(&self) -> &ProtocolFeatureManager {
        &self.protocol_features
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    // --- head and fork database queries ---

    pub fn head_block_state(&self) -> BlockStatePtr {
        self.head.clone()
    }

    pub fn head_block_num(&self) -> u32 {
        self.head.block_num()
    }

    pub fn head_block_id(&self) -> BlockId {
        self.head.id()
    }

    pub fn head_block_time(&self) -> TimePoint {
        self.head.header_state.timestamp().to_time_point()
    }

    pub fn head_block_producer(&self) -> AccountName {
        self.head.header_state.header.producer.clone()
    }

    /// Best tip of the fork database; in irreversible mode this is the
    /// best block received, not the applied head.
    pub fn fork_db_head(&self) -> Option<BlockStatePtr> {
        if self.config.read_mode == DbReadMode::Irreversible {
            self.fork_db.pending_head()
        } else {
            self.fork_db.head()
        }
    }

    pub fn fork_db_head_block_num(&self) -> u32 {
        self.fork_db_head().map_or(0, |b| b.block_num())
    }

    pub fn last_irreversible_block_num(&self) -> u32 {
        self.fork_db.root().map_or(0, |r| r.block_num())
    }

    pub fn last_irreversible_block_id(&self) -> Option<BlockId> {
        self.fork_db.root().map(|r| r.id())
    }

    pub fn fetch_block_state_by_id(&self, id: &BlockId) -> Option<BlockStatePtr> {
        self.fork_db.get_block(id)
    }

    pub fn fetch_block_state_by_number(&self, block_num: u32) -> Option<BlockStatePtr> {
        let head = self.fork_db_head()?;
        self.fork_db.search_on_branch(&head.id(), block_num)
    }

    /// Reversible blocks first, then the block log.
    pub fn fetch_block_by_number(&self, block_num: u32) -> Result<Option<Arc<SignedBlock>>> {
        if let Some(state) = self.fetch_block_state_by_number(block_num) {
            return Ok(Some(state.block.clone()));
        }
        Ok(self.block_log.read_signed_block_by_num(block_num)?.map(Arc::new))
    }

    pub fn fetch_block_by_id(&self, id: &BlockId) -> Result<Option<Arc<SignedBlock>>> {
        if let Some(state) = self.fork_db.get_block(id) {
            return Ok(Some(state.block.clone()));
        }
        let block = self.block_log.read_signed_block_by_num(id.block_num())?;
        Ok(block.filter(|b| b.id() == *id).map(Arc::new))
    }

    pub fn get_block_id_for_num(&self, block_num: u32) -> Result<Option<BlockId>> {
        if let Some(state) = self.fetch_block_state_by_number(block_num) {
            return Ok(Some(state.id()));
        }
        if let Some(root) = self.fork_db.root() {
            if root.block_num() == block_num {
                return Ok(Some(root.id()));
            }
        }
        Ok(self.block_log.read_block_id_by_num(block_num)?)
    }

    // --- pending block queries ---

    pub fn pending_block_time(&self) -> Result<TimePoint> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        Ok(pending.timestamp().to_time_point())
    }

    pub fn pending_block_num(&self) -> Option<u32> {
        self.pending.as_ref().map(PendingState::block_num)
    }

    pub fn pending_block_producer(&self) -> Option<AccountName> {
        self.pending.as_ref().map(PendingState::producer)
    }

    /// Stage name of the pending block, if any.
    pub fn pending_block_stage(&self) -> Option<&'static str> {
        self.pending.as_ref().map(|p| p.block_stage.name())
    }

    /// The signed pending block, once it reached the completed stage.
    pub fn pending_block_state(&self) -> Option<BlockStatePtr> {
        match &self.pending.as_ref()?.block_stage {
            BlockStage::Completed(c) => Some(c.block_state.clone()),
            _ => None,
        }
    }

    pub fn pending_block_status(&self) -> Option<BlockStatus> {
        self.pending.as_ref().map(|p| p.block_status)
    }

    pub fn is_building_block(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| matches!(p.block_stage, BlockStage::Building(_)))
    }

    /// Whether the pending block is being produced locally.
    pub fn is_producing_block(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.block_status == BlockStatus::Incomplete)
    }

    pub fn is_known_unexpired_transaction(&self, id: &TransactionId) -> Result<bool> {
        Ok(self.db.find::<TransactionObject>(id.as_bytes())?.is_some())
    }

    pub fn get_account(&self, name: &AccountName) -> Result<AccountObject> {
        self.db
            .find(&AccountObject::key(name))?
            .ok_or_else(|| ChainError::UnknownAccount(name.clone()))
    }

    pub fn get_global_properties(&self) -> Result<GlobalPropertyObject> {
        Ok(self.db.get(&singleton_key())?)
    }

    /// Deferred transactions due at the pending block time (head time when
    /// no block is pending), earliest first.
    pub fn get_scheduled_transactions(&self) -> Result<Vec<TransactionId>> {
        let now = match &self.pending {
            Some(p) => p.timestamp().to_time_point(),
            None => self.head_block_time(),
        };
        let mut due: Vec<GeneratedTransactionObject> = self
            .db
            .all::<GeneratedTransactionObject>()?
            .into_iter()
            .filter(|g| g.delay_until <= now)
            .collect();
        due.sort_by(|a, b| (a.delay_until, a.trx_id).cmp(&(b.delay_until, b.trx_id)));
        Ok(due.into_iter().map(|g| g.trx_id).collect())
    }

    // --- producer schedules ---

    pub fn active_producers(&self) -> ProducerSchedule {
        match self.pending.as_ref().map(|p| &p.block_stage) {
            Some(BlockStage::Building(b)) => b.pending_block_header_state.common.active_schedule.clone(),
            Some(BlockStage::Assembled(a)) => a.pending_block_header_state.common.active_schedule.clone(),
            Some(BlockStage::Completed(c)) => c.block_state.header_state.common.active_schedule.clone(),
            None => self.head.header_state.common.active_schedule.clone(),
        }
    }

    pub fn pending_producers(&self) -> ProducerSchedule {
        match self.pending.as_ref().map(|p| &p.block_stage) {
            Some(BlockStage::Building(b)) => b
                .new_pending_producer_schedule
                .clone()
                .unwrap_or_else(|| b.pending_block_header_state.prev_pending_schedule.schedule.clone()),
            Some(BlockStage::Assembled(a)) => a
                .unsigned_block
                .header
                .new_producers
                .clone()
                .unwrap_or_else(|| a.pending_block_header_state.prev_pending_schedule.schedule.clone()),
            Some(BlockStage::Completed(c)) => c.block_state.header_state.pending_schedule.schedule.clone(),
            None => self.head.header_state.pending_schedule.schedule.clone(),
        }
    }

    pub fn proposed_producers(&self) -> Result<Option<ProducerSchedule>> {
        let gpo = self.get_global_properties()?;
        Ok(gpo.proposed_schedule_block_num.map(|_| gpo.proposed_schedule))
    }

    /// Propose a schedule from the pending block. Returns the version it
    /// will take or `-1` when nothing was proposed.
    pub fn set_proposed_producers(&mut self, producers: Vec<ProducerKey>) -> Result<i64> {
        let chain = self.chain_context()?;
        propose_producer_schedule(&chain, producers)
    }

    /// Mark `digest` for activation by the next block started.
    pub fn preactivate_feature(&mut self, digest: &Digest) -> Result<()> {
        let chain = self.chain_context()?;
        preactivate_protocol_feature(&chain, digest)?;
        info!(feature = %digest, "[cc-04] protocol feature pre-activated");
        Ok(())
    }

    /// Abort any pending block, persist the fork database and flush state.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.abort_block();
        if self.started {
            self.fork_db.close()?;
        }
        self.db.flush()?;
        self.closed = true;
        info!(head = self.head_block_num(), "[cc-04] controller closed");
        Ok(())
    }

    // --- internals shared by the submodules ---

    fn light_validation_allowed(&self, checks_forced: bool) -> bool {
        let Some(pending) = &self.pending else {
            return false;
        };
        if self.in_trx_requiring_checks {
            return false;
        }
        let status = pending.block_status;
        let skipping_on_replay =
            matches!(status, BlockStatus::Irreversible | BlockStatus::Validated) && !checks_forced;
        let skipping_on_validate = status == BlockStatus::Complete
            && (self.config.block_validation_mode == ValidationMode::Light
                || self.trusted_producer_light_validation);
        skipping_on_replay || skipping_on_validate
    }

    fn skip_auth_check(&self) -> bool {
        self.light_validation_allowed(self.config.force_all_checks)
    }

    fn skip_trx_checks(&self) -> bool {
        self.light_validation_allowed(self.config.disable_replay_opts)
    }

    fn skip_db_sessions_for(&self, status: BlockStatus) -> bool {
        status == BlockStatus::Irreversible && !self.config.disable_replay_opts && !self.in_trx_requiring_checks
    }

    fn skip_db_sessions(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| self.skip_db_sessions_for(p.block_status))
    }

    /// View handed to transaction execution; requires a building block.
    fn chain_context(&self) -> Result<ChainContext<'_>> {
        let pending = self.pending.as_ref().ok_or(ChainError::NoPendingBlock)?;
        let building = pending.building()?;
        let pbhs = &building.pending_block_header_state;
        Ok(ChainContext {
            db: &self.db,
            config: &self.config,
            resource_limits: &*self.resource_limits,
            authorization: &*self.authorization,
            engine: &*self.engine,
            protocol_features: &self.protocol_features,
            pending_header: pbhs,
            chain_id: self.chain_id,
            pending: PendingBlockInfo {
                block_num: pbhs.block_num(),
                timestamp: pbhs.timestamp,
                producing: pending.block_status == BlockStatus::Incomplete,
                skip_auth_check: self.skip_auth_check(),
                skip_trx_checks: self.skip_trx_checks(),
                skip_db_sessions: self.skip_db_sessions(),
                replay_head_time: self.replay_head_time,
                producer_block_id: pending.producer_block_id,
            },
        })
    }

    /// Closure validating the feature activations of a block, for the fork
    /// database and block state construction.
    fn feature_validator(
        &self,
    ) -> impl Fn(BlockTimestamp, &BTreeSet<Digest>, &[Digest]) -> Result<()> + Send + Sync + 'static {
        let set = self.protocol_features.set().clone();
        move |timestamp, activated, new_features| check_protocol_features(&set, timestamp, activated, new_features)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "[cc-04] failed to close controller");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{key_of, TestChain};

    #[test]
    fn test_queries_before_and_after_a_block() {
        let mut chain = TestChain::new();
        let c = &chain.controller;
        assert_eq!(c.head_block_num(), 1);
        assert_eq!(c.pending_block_stage(), None);
        assert!(matches!(c.pending_block_time(), Err(ChainError::NoPendingBlock)));

        chain.start();
        let c = &chain.controller;
        assert_eq!(c.pending_block_stage(), Some("building"));
        assert_eq!(c.pending_block_num(), Some(2));
        assert!(c.is_producing_block());
        let slot = BlockTimestamp::from(c.head_block_time().add_micros(500_000));
        assert_eq!(c.pending_block_time().unwrap(), slot.to_time_point());
        assert!(c.pending_block_state().is_none());

        let produced = chain.finish();
        let c = &chain.controller;
        assert_eq!(c.head_block_id(), produced.id());
        assert_eq!(c.get_block_id_for_num(2).unwrap(), Some(produced.id()));
        assert_eq!(c.fetch_block_by_id(&produced.id()).unwrap().unwrap().id(), produced.id());
        assert_eq!(c.fetch_block_by_number(2).unwrap().unwrap().id(), produced.id());
        assert!(c.fetch_block_by_number(9).unwrap().is_none());
        assert_eq!(c.head_block_producer(), AccountName::new("system"));
    }

    #[test]
    fn test_single_producer_schedule_and_proposal() {
        let mut chain = TestChain::new();
        let active = chain.controller.active_producers();
        assert_eq!(active.producers.len(), 1);
        assert_eq!(active.producers[0].producer_name, AccountName::new("system"));
        assert!(chain.controller.proposed_producers().unwrap().is_none());

        chain.start();
        chain.create_account("bp1", None);
        let version = chain
            .controller
            .set_proposed_producers(vec![ProducerKey {
                producer_name: AccountName::new("bp1"),
                block_signing_key: key_of("bp1").public_key(),
            }])
            .unwrap();
        assert_eq!(version, 1);
        let proposed = chain.controller.proposed_producers().unwrap().unwrap();
        assert_eq!(proposed.version, 1);
        chain.finish();
    }

    #[test]
    fn test_set_proposed_producers_requires_building_block() {
        let mut chain = TestChain::new();
        assert!(matches!(
            chain.controller.set_proposed_producers(vec![]),
            Err(ChainError::NoPendingBlock)
        ));
    }

    #[test]
    fn test_light_validation_rules() {
        let mut chain = TestChain::new();
        assert!(!chain.controller.skip_auth_check());
        chain.start();
        // producing: never light
        assert!(!chain.controller.skip_auth_check());
        assert!(!chain.controller.skip_trx_checks());
        assert!(!chain.controller.skip_db_sessions());
        chain.controller.abort_block();

        chain.controller.config.block_validation_mode = ValidationMode::Light;
        chain.start();
        if let Some(p) = chain.controller.pending.as_mut() {
            p.block_status = BlockStatus::Complete;
        }
        assert!(chain.controller.skip_auth_check());
        chain.controller.in_trx_requiring_checks = true;
        assert!(!chain.controller.skip_auth_check());
        chain.controller.in_trx_requiring_checks = false;
        chain.controller.abort_block();
    }
}
